mod json;

pub use json::{generate_template, json_to_markdown};

/// Returns true if the content type header indicates HTML.
pub fn is_html_content_type(ct: &str) -> bool {
    ct.to_ascii_lowercase().contains("text/html")
}

/// Returns true if the content type header indicates JSON.
pub fn is_json_content_type(ct: &str) -> bool {
    ct.to_ascii_lowercase().contains("application/json")
}

/// Converts an HTML document to Markdown, trimmed of surrounding whitespace.
///
/// Conversion is best-effort: malformed input yields whatever text the
/// parser can extract.
pub fn html_to_markdown(html: &str) -> String {
    html2md::parse_html(html).trim().to_string()
}
