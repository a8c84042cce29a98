use std::sync::Arc;

use crate::moodle::MoodleClient;

/// Maps a meeting topic to an LMS course id.
///
/// Lookup strategies are tried in a fixed order against a list of
/// progressively simplified topic variants; the first non-empty result wins.
pub struct CourseResolver {
    moodle: Arc<MoodleClient>,
}

impl CourseResolver {
    pub fn new(moodle: Arc<MoodleClient>) -> Self {
        Self { moodle }
    }

    /// `Ok(None)` means no course could be resolved and no default is set.
    #[instrument(skip(self))]
    pub async fn resolve(&self, topic: &str) -> anyhow::Result<Option<i64>> {
        for candidate in topic_candidates(topic) {
            if let Some(course_id) = self.lookup(&candidate).await? {
                debug!(course_id, candidate, "Topic resolved");
                return Ok(Some(course_id));
            }
        }

        if let Some(default_course_id) = self.moodle.default_course_id() {
            debug!(default_course_id, "Falling back to the configured default course");
            return Ok(Some(default_course_id));
        }

        Ok(None)
    }

    /// The four lookup strategies of a single candidate string.
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<i64>> {
        let courses = self.moodle.all_courses().await?;

        let exact = courses.iter().find(|course| {
            course
                .fullname
                .as_deref()
                .is_some_and(|fullname| fullname.trim().eq_ignore_ascii_case(name))
                || course
                    .displayname
                    .as_deref()
                    .is_some_and(|displayname| displayname.trim().eq_ignore_ascii_case(name))
        });

        if let Some(course) = exact {
            return Ok(Some(course.id));
        }

        let by_fullname = self.moodle.courses_by_field("fullname", name).await?;
        if let Some(course) = by_fullname.first() {
            return Ok(Some(course.id));
        }

        let by_shortname = self.moodle.courses_by_field("shortname", name).await?;
        if let Some(course) = by_shortname.first() {
            return Ok(Some(course.id));
        }

        let found = self.moodle.search_courses(name).await?;
        Ok(found.first().map(|course| course.id))
    }
}

/// Ordered candidate strings for a topic: the topic itself, then normalized
/// variants (each building on the previous one), then progressive
/// right-truncations of the original.
pub(crate) fn topic_candidates(topic: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    push_candidate(&mut candidates, topic.to_owned());

    let trimmed = trim_trailing_bracket_group(topic);
    push_candidate(&mut candidates, trimmed.clone());

    let left = left_segment(&trimmed);
    push_candidate(&mut candidates, left.clone());

    let stripped = strip_uppercase_suffix(&left);
    push_candidate(&mut candidates, stripped);

    let words: Vec<&str> = topic.split_whitespace().collect();
    for dropped in 1..=3usize {
        if words.len() >= dropped + 2 {
            push_candidate(&mut candidates, words[..words.len() - dropped].join(" "));
        }
    }

    candidates
}

fn push_candidate(candidates: &mut Vec<String>, raw: String) {
    let cleaned = raw
        .trim()
        .trim_end_matches(['-', '–', '—', ':', '|'])
        .trim()
        .to_owned();

    if !cleaned.is_empty() && !candidates.contains(&cleaned) {
        candidates.push(cleaned);
    }
}

/// `"Curso (EP)"` → `"Curso"`, `"Curso [2025]"` → `"Curso"`
fn trim_trailing_bracket_group(text: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"\s*[(\[][^)\]]*[)\]]\s*$").expect("valid regex"));
    re.replace(text.trim(), "").into_owned()
}

/// Left side of the first `-`, `–`, `—`, `:` or `|`.
fn left_segment(text: &str) -> String {
    match text.find(['-', '–', '—', ':', '|']) {
        Some(index) => text[..index].trim().to_owned(),
        None => text.trim().to_owned(),
    }
}

/// Drops a trailing 1–3 uppercase-letter tag, parenthesized or bare.
fn strip_uppercase_suffix(text: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re =
        RE.get_or_init(|| regex::Regex::new(r"(?:\s*\(\s*[A-Z]{1,3}\s*\)|\s+[A-Z]{1,3})\s*$").expect("valid regex"));
    re.replace(text.trim(), "").into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn accented_topic_walks_down_to_the_bare_name() {
        let candidates = topic_candidates("Matemáticas Básicas (EP) - Lunes");

        assert_eq!(
            candidates,
            vec![
                "Matemáticas Básicas (EP) - Lunes".to_owned(),
                "Matemáticas Básicas (EP)".to_owned(),
                "Matemáticas Básicas".to_owned(),
            ]
        );
    }

    #[rstest]
    #[case("Historia Moderna: Grupo B", vec!["Historia Moderna: Grupo B", "Historia Moderna", "Historia Moderna: Grupo"])]
    #[case("Física I | Teoría", vec!["Física I | Teoría", "Física I", "Física"])]
    #[case("Química EP", vec!["Química EP", "Química"])]
    fn separators_and_suffixes_are_peeled_off(#[case] topic: &str, #[case] expected: Vec<&str>) {
        let expected: Vec<String> = expected.into_iter().map(str::to_owned).collect();
        assert_eq!(topic_candidates(topic), expected);
    }

    #[test]
    fn truncation_needs_at_least_two_remaining_words() {
        let candidates = topic_candidates("Uno Dos Tres Cuatro Cinco");

        assert!(candidates.contains(&"Uno Dos Tres Cuatro".to_owned()));
        assert!(candidates.contains(&"Uno Dos Tres".to_owned()));
        assert!(candidates.contains(&"Uno Dos".to_owned()));
        assert!(!candidates.contains(&"Uno".to_owned()));
    }

    #[test]
    fn single_word_topics_yield_one_candidate() {
        assert_eq!(topic_candidates("Matemáticas"), vec!["Matemáticas".to_owned()]);
    }
}
