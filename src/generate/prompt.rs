use serde::Serialize;

const MAX_ABSTRACT_CHARS: usize = 500;

#[derive(Serialize)]
struct PromptPaper<'a> {
    title: &'a str,
    year: Option<u32>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_ABSTRACT_CHARS {
        let head: String = text.chars().take(MAX_ABSTRACT_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Illustration prompt for a paper. Only title, year and abstract go in;
/// search snippets carry highlighted query terms and are left out.
pub fn build_prompt(title: &str, abstract_text: Option<&str>, year: Option<u32>) -> String {
    let paper = PromptPaper {
        title,
        year,
        abstract_text: abstract_text.filter(|a| !a.trim().is_empty()).map(truncate),
    };
    let paper_json = serde_json::to_string_pretty(&paper).unwrap_or_else(|_| title.to_string());
    format!(
        "Create an engaging, informative scientific visualization that captures the essence of this research paper.\n\
         Paper Data:\n\
         {}\n\n\
         Style: Modern, professional scientific illustration with clean design.\n\
         Goal: Grab reader attention and convey the research's key concepts visually.\n\
         Make it informative, insightful, and visually compelling for academic audiences.",
        paper_json
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_paper_fields() {
        let prompt = build_prompt("Attention Is All You Need", Some("Transformers."), Some(2017));
        assert!(prompt.contains("\"title\": \"Attention Is All You Need\""));
        assert!(prompt.contains("\"abstract\": \"Transformers.\""));
        assert!(prompt.contains("2017"));
        assert!(prompt.starts_with("Create an engaging"));
    }

    #[test]
    fn test_long_abstract_truncated() {
        let long = "é".repeat(MAX_ABSTRACT_CHARS + 20);
        let prompt = build_prompt("T", Some(&long), None);
        let expected = format!("{}...", "é".repeat(MAX_ABSTRACT_CHARS));
        assert!(prompt.contains(&expected));
        assert!(!prompt.contains(&long));
    }

    #[test]
    fn test_blank_abstract_is_null() {
        let prompt = build_prompt("T", Some("   "), None);
        assert!(prompt.contains("\"abstract\": null"));
    }
}
