use regex::Regex;

const TEXT_ALTERNATIVE_MAX_CHARS: usize = 1_000;

/// Derives the plain-text alternative shipped alongside HTML bodies.
pub(crate) struct TextExtractor {
    style_blocks: Regex,
    tags: Regex,
    whitespace: Regex,
}

impl TextExtractor {
    pub fn new() -> Self {
        Self {
            style_blocks: Regex::new(r"(?is)<(style|script)\b[^>]*>.*?</(style|script)>")
                .expect("static regex"),
            tags: Regex::new(r"(?s)<[^>]+>").expect("static regex"),
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    /// Strip `<style>`/`<script>` blocks and remaining tags, collapse
    /// whitespace, and cap the result at 1,000 characters.
    pub fn plain_text_of(&self, html: &str) -> String {
        let without_blocks = self.style_blocks.replace_all(html, " ");
        let without_tags = self.tags.replace_all(&without_blocks, " ");
        let collapsed = self.whitespace.replace_all(&without_tags, " ");
        let trimmed = collapsed.trim();

        trimmed.chars().take(TEXT_ALTERNATIVE_MAX_CHARS).collect()
    }
}
