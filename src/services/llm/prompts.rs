// Prompt templates for post interpretation

/// System message sent with every text-model call
pub const ANALYST_SYSTEM_PROMPT: &str =
    "You are a careful content analyst who summarizes posts and pulls out what matters.";

/// Prompt for a post that carries images; the images ride along as attachments.
pub fn vision_prompt(post_text: &str) -> String {
    format!(
        r#"# Role
Social media content analyst.

# Context
The post below was published with one or more images. Read the text and the
attached images together and explain what the author is communicating.

# Input
- Post text: "{post_text}"
- Images: see attachments

# Output, in this order
1. **Original post**: the post content with a one-line summary.
2. **Images**: for each image, what it shows, why it matters and how it relates to the text.
3. **Deep reading**: combining text and images, the author's mood, stance and the core idea they want to get across.

Follow this structure exactly."#
    )
}

/// Prompt for a text-only reading, also used when images could not be used.
pub fn text_prompt(post_text: &str) -> String {
    format!(
        r#"# Role
Social media content analyst.

# Context
The post below is plain text. Dig into the information, mood and intent behind it.

# Input
- Post text: "{post_text}"

# Output, in this order
1. **Original post**: the post content with a short summary.
2. **Core points**: a bullet list of the main claims, topics or facts.
3. **Tone**: the emotions the author shows (joy, reflection, criticism, ...) and the overall tone.
4. **Deep reading**: the likely motive for posting and the reaction the author hopes to provoke.

Follow this structure exactly."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_embed_post_text() {
        assert!(vision_prompt("sunset over the bay").contains("\"sunset over the bay\""));
        assert!(text_prompt("quarterly numbers").contains("\"quarterly numbers\""));
        assert!(vision_prompt("x").contains("Images"));
        assert!(!text_prompt("x").contains("attachments"));
    }
}
