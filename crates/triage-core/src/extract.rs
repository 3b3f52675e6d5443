use crate::model::{ExtractedData, Priority};
use regex::Regex;
use std::sync::LazyLock;

/// Case-sensitive on purpose: a casual "we should close this" must
/// not trip the auto-close path.
pub const CLOSE_MARKER: &str = "RECOMMENDATION: CLOSE ISSUE";

/// Fixed category vocabulary; first term found in the text wins.
const CATEGORY_VOCABULARY: &[&str] = &["bug", "feature", "question", "documentation", "enhancement"];

static LABEL_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    CATEGORY_VOCABULARY
        .iter()
        .map(|term| {
            let pattern = format!(r"(?i)\b{term}\b");
            (
                Regex::new(&pattern).expect("label pattern must compile"),
                *term,
            )
        })
        .collect()
});

static HIGH_PRIORITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)high[\s:._-]*priority|priority[\s:._-]*high|\bcritical\b|\burgent\b")
        .expect("high priority pattern must compile")
});

static LOW_PRIORITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)low[\s:._-]*priority|priority[\s:._-]*low|\bminor\b|\btrivial\b")
        .expect("low priority pattern must compile")
});

static NEEDS_MORE_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)needs?[\s._-]*more[\s._-]*(?:info(?:rmation)?|details?)|\bunclear\b")
        .expect("needs-more-info pattern must compile")
});

static IS_DUPLICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)duplicate[\s._-]*of|already[\s._-]*tracked|already[\s._-]*reported")
        .expect("duplicate pattern must compile")
});

/// Parses free-form model text into structured triage fields.
///
/// Total by contract: unmatched patterns leave fields at their
/// defaults, so any input (including the empty string) yields a fully
/// populated record. This is pattern matching, not understanding --
/// tests pin the literal patterns only.
pub fn extract(response: &str) -> ExtractedData {
    let mut data = ExtractedData::default();

    for (pattern, label) in LABEL_PATTERNS.iter() {
        if pattern.is_match(response) {
            push_label(&mut data.labels, label);
        }
    }

    // High wins over low when both markers appear.
    let mut priority_matched = false;
    if HIGH_PRIORITY.is_match(response) {
        data.priority = Priority::High;
        priority_matched = true;
    } else if LOW_PRIORITY.is_match(response) {
        data.priority = Priority::Low;
        priority_matched = true;
    }

    if let Some((_, term)) = LABEL_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(response))
    {
        data.category = (*term).to_string();
    }

    // Only an explicit priority marker earns a priority label; the
    // default never does, so empty input extracts zero labels.
    if priority_matched {
        push_label(&mut data.labels, &format!("priority-{}", data.priority.as_str()));
    }

    data.needs_more_info = NEEDS_MORE_INFO.is_match(response);
    data.is_duplicate = IS_DUPLICATE.is_match(response);
    data.should_close = response.contains(CLOSE_MARKER);

    data
}

fn push_label(labels: &mut Vec<String>, label: &str) {
    if !labels.iter().any(|existing| existing == label) {
        labels.push(label.to_string());
    }
}
