use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;

use crate::pipeline::{self, PipelineStatus};
use crate::zoom::webhook::{
    self, RecordingCompletedPayload, UrlValidationPayload, WebhookEnvelope, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::AppState;

/// Webhook entry point.
///
/// The HTTP status is always 200 so the provider never disables the
/// subscription; the logical outcome travels in the JSON body. The raw body
/// bytes are kept as received because the signature covers them verbatim.
pub(crate) async fn post_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    let conf = state.conf_handle.get_conf();

    let Ok(envelope) = serde_json::from_slice::<WebhookEnvelope>(&body) else {
        debug!("Unparseable webhook body");
        return Json(serde_json::json!({ "status": "ignored" }));
    };

    debug!(
        event = %envelope.event,
        signature_disabled = conf.zoom.webhook_disable_signature,
        "Webhook received"
    );

    // The handshake is answered before any signature checking.
    if envelope.event == webhook::URL_VALIDATION {
        return Json(handle_url_validation(&conf.zoom.webhook_secret, &envelope));
    }

    let Some(secret) = conf.zoom.webhook_secret.as_deref() else {
        warn!("No webhook secret configured, ignoring the event");
        return Json(serde_json::json!({ "status": "ignored" }));
    };

    if conf.zoom.webhook_disable_signature {
        warn!("Signature verification is DISABLED, accepting the event unverified");
    } else {
        let timestamp = header_str(&headers, TIMESTAMP_HEADER);
        let signature = header_str(&headers, SIGNATURE_HEADER);

        let valid = match (timestamp, signature) {
            (Some(timestamp), Some(signature)) => webhook::verify_signature(secret, timestamp, signature, &body),
            _ => false,
        };

        if !valid {
            warn!(event = %envelope.event, "Invalid webhook signature");
            return Json(serde_json::json!({ "status": "invalid-signature" }));
        }
    }

    if envelope.event != webhook::RECORDING_COMPLETED {
        debug!(event = %envelope.event, "Unhandled event type");
        return Json(serde_json::json!({ "status": "ignored" }));
    }

    let payload = match serde_json::from_value::<RecordingCompletedPayload>(envelope.payload) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "Malformed recording.completed payload");
            return Json(serde_json::json!({ "status": "ignored" }));
        }
    };

    match pipeline::process_completed_recording(&state, payload.object, envelope.download_token).await {
        Ok(PipelineStatus::Done { drive_url }) => Json(serde_json::json!({
            "status": "done",
            "driveUrl": drive_url,
        })),
        Ok(PipelineStatus::InFlight) => Json(serde_json::json!({ "status": "in-flight" })),
        Ok(PipelineStatus::Ignored { reason }) => Json(serde_json::json!({
            "status": "ignored",
            "reason": reason,
        })),
        Err(error) => {
            error!(error = format!("{error:#}"), "Pipeline failed");
            Json(serde_json::json!({ "status": "error" }))
        }
    }
}

fn handle_url_validation(secret: &Option<String>, envelope: &WebhookEnvelope) -> serde_json::Value {
    let Ok(payload) = serde_json::from_value::<UrlValidationPayload>(envelope.payload.clone()) else {
        return serde_json::json!({ "status": "ignored" });
    };

    let Some(secret) = secret.as_deref() else {
        return serde_json::json!({ "status": "ignored" });
    };

    serde_json::json!({
        "plainToken": payload.plain_token,
        "encryptedToken": webhook::encrypt_token(secret, &payload.plain_token),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
