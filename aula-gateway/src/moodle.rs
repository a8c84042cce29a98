use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::config::MoodleConf;
use crate::drive;

/// Forum picked first when present in the course.
const PREFERRED_FORUM_NAME: &str = "Clases Grabadas";

/// Announcement-style fallbacks, in order of preference.
const FALLBACK_FORUM_NAMES: [&str; 3] = ["Anuncios", "Announcements", "News forum"];

/// Client for the LMS web-service API (form-encoded REST protocol).
pub struct MoodleClient {
    client: reqwest::Client,
    conf: MoodleConf,
    courses_cache: tokio::sync::Mutex<Option<CachedCourses>>,
}

struct CachedCourses {
    fetched_at: Instant,
    courses: Arc<Vec<Course>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub id: i64,
    pub fullname: Option<String>,
    pub shortname: Option<String>,
    pub displayname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Forum {
    pub id: i64,
    pub course: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CourseList {
    #[serde(default)]
    courses: Vec<Course>,
}

#[derive(Debug, Deserialize)]
struct NewDiscussion {
    discussionid: i64,
}

impl MoodleClient {
    pub fn new(conf: MoodleConf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("couldn't build the LMS HTTP client")?;

        Ok(Self {
            client,
            conf,
            courses_cache: tokio::sync::Mutex::new(None),
        })
    }

    pub fn default_course_id(&self) -> Option<i64> {
        self.conf.default_course_id
    }

    fn endpoint(&self) -> anyhow::Result<Url> {
        self.conf
            .base_url
            .join("webservice/rest/server.php")
            .context("invalid LMS base URL")
    }

    /// One web-service call. The LMS reports failures as a JSON object with an
    /// `exception` key and a 200 status, so errors are detected on the body.
    async fn ws_call<T: DeserializeOwned>(&self, function: &str, params: &[(String, String)]) -> anyhow::Result<T> {
        let mut form: Vec<(String, String)> = vec![
            ("wstoken".to_owned(), self.conf.ws_token.clone()),
            ("wsfunction".to_owned(), function.to_owned()),
            ("moodlewsrestformat".to_owned(), "json".to_owned()),
        ];
        form.extend_from_slice(params);

        let response = self
            .client
            .post(self.endpoint()?)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("{function} request failed"))?
            .error_for_status()
            .with_context(|| format!("{function} returned an error status"))?;

        let value = response
            .json::<serde_json::Value>()
            .await
            .with_context(|| format!("couldn't parse the {function} response"))?;

        if let Some(exception) = value.get("exception").and_then(|v| v.as_str()) {
            let message = value.get("message").and_then(|v| v.as_str()).unwrap_or("unknown");
            anyhow::bail!("{function} raised {exception}: {message}");
        }

        serde_json::from_value(value).with_context(|| format!("unexpected {function} response shape"))
    }

    /// Full course list, cached for the configured TTL.
    pub async fn all_courses(&self) -> anyhow::Result<Arc<Vec<Course>>> {
        let mut cache = self.courses_cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.conf.courses_cache_ttl {
                return Ok(Arc::clone(&cached.courses));
            }
        }

        let courses: Vec<Course> = self.ws_call("core_course_get_courses", &[]).await?;
        let courses = Arc::new(courses);

        *cache = Some(CachedCourses {
            fetched_at: Instant::now(),
            courses: Arc::clone(&courses),
        });

        Ok(courses)
    }

    pub async fn courses_by_field(&self, field: &str, value: &str) -> anyhow::Result<Vec<Course>> {
        let list: CourseList = self
            .ws_call(
                "core_course_get_courses_by_field",
                &[("field".to_owned(), field.to_owned()), ("value".to_owned(), value.to_owned())],
            )
            .await?;

        Ok(list.courses)
    }

    pub async fn search_courses(&self, text: &str) -> anyhow::Result<Vec<Course>> {
        let list: CourseList = self
            .ws_call(
                "core_course_search_courses",
                &[
                    ("criterianame".to_owned(), "search".to_owned()),
                    ("criteriavalue".to_owned(), text.to_owned()),
                ],
            )
            .await?;

        Ok(list.courses)
    }

    pub async fn forums_by_course(&self, course_id: i64) -> anyhow::Result<Vec<Forum>> {
        self.ws_call(
            "mod_forum_get_forums_by_courses",
            &[("courseids[0]".to_owned(), course_id.to_string())],
        )
        .await
    }

    /// Picks the forum recordings get announced in.
    pub async fn resolve_forum_id(&self, course_id: i64) -> anyhow::Result<i64> {
        let forums = self.forums_by_course(course_id).await?;

        Ok(select_forum(&forums)
            .context("the course has no forum to post into")?
            .id)
    }

    pub async fn create_discussion(&self, forum_id: i64, subject: &str, message: &str) -> anyhow::Result<i64> {
        let created: NewDiscussion = self
            .ws_call(
                "mod_forum_add_discussion",
                &[
                    ("forumid".to_owned(), forum_id.to_string()),
                    ("subject".to_owned(), subject.to_owned()),
                    ("message".to_owned(), message.to_owned()),
                ],
            )
            .await?;

        info!(forum_id, discussion_id = created.discussionid, "Discussion created");

        Ok(created.discussionid)
    }
}

/// "Clases Grabadas" wins, then the announcement forum, then whatever the
/// listing returned first.
pub fn select_forum(forums: &[Forum]) -> Option<&Forum> {
    if let Some(forum) = forums
        .iter()
        .find(|forum| forum.name.trim().eq_ignore_ascii_case(PREFERRED_FORUM_NAME))
    {
        return Some(forum);
    }

    if let Some(forum) = forums.iter().find(|forum| {
        FALLBACK_FORUM_NAMES
            .iter()
            .any(|name| forum.name.trim().eq_ignore_ascii_case(name))
            || forum.kind.as_deref() == Some("news")
    }) {
        return Some(forum);
    }

    forums.first()
}

/// Fixed HTML snippet embedding the stored artifact's preview.
///
/// 56.25% padding keeps a 16:9 box; the transparent layer sits over the
/// pop-out control so readers stay inside the course page.
pub fn preview_embed_html(view_url: &str) -> String {
    let preview_url = drive::view_to_preview_url(view_url);

    format!(
        r#"<div style="position:relative;padding-bottom:56.25%;height:0;overflow:hidden;">
<iframe src="{preview_url}" style="position:absolute;top:0;left:0;width:100%;height:100%;border:0;" allow="autoplay" allowfullscreen></iframe>
<div style="position:absolute;top:0;right:0;width:58px;height:58px;background:transparent;"></div>
</div>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forum(id: i64, name: &str, kind: Option<&str>) -> Forum {
        Forum {
            id,
            course: 13,
            name: name.to_owned(),
            kind: kind.map(str::to_owned),
        }
    }

    #[test]
    fn preferred_forum_wins_over_everything() {
        let forums = vec![
            forum(1, "General", Some("general")),
            forum(2, "Anuncios", Some("news")),
            forum(3, "Clases Grabadas", Some("general")),
        ];

        assert_eq!(select_forum(&forums).expect("selected").id, 3);
    }

    #[test]
    fn announcement_forum_is_the_fallback() {
        let forums = vec![
            forum(1, "General", Some("general")),
            forum(2, "News forum", Some("news")),
        ];

        assert_eq!(select_forum(&forums).expect("selected").id, 2);

        let by_kind = vec![
            forum(1, "General", Some("general")),
            forum(2, "Tablón", Some("news")),
        ];

        assert_eq!(select_forum(&by_kind).expect("selected").id, 2);
    }

    #[test]
    fn first_forum_is_the_last_resort() {
        let forums = vec![forum(7, "Dudas", Some("general")), forum(8, "Taller", Some("general"))];

        assert_eq!(select_forum(&forums).expect("selected").id, 7);
        assert!(select_forum(&[]).is_none());
    }

    #[test]
    fn embed_html_points_at_the_preview_url() {
        let html = preview_embed_html("https://drive.google.com/file/d/1AbC/view");

        assert!(html.contains("https://drive.google.com/file/d/1AbC/preview"));
        assert!(html.contains("padding-bottom:56.25%"));
        assert!(html.contains("<iframe"));
    }
}
