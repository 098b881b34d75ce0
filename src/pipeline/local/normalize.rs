use crate::pipeline::collaborators::Normalizer;

/// Default normalizer: drops control characters, collapses runs of
/// horizontal whitespace and trims each line. Blank lines collapse to one
/// so paragraph breaks survive.
pub struct TextSanitizer;

impl Normalizer for TextSanitizer {
    fn normalize(&self, raw: &str) -> String {
        sanitize_text(raw)
    }
}

pub fn sanitize_text(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c == '\t' || c == '\r' { ' ' } else { c })
        .filter(|c| *c == '\n' || !c.is_control())
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}'))
        .collect();

    let mut out: Vec<String> = Vec::new();
    for line in cleaned.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if out.last().map(|l| !l.is_empty()).unwrap_or(false) {
                out.push(String::new());
            }
        } else {
            out.push(collapsed);
        }
    }
    while out.last().map(|l| l.is_empty()).unwrap_or(false) {
        out.pop();
    }
    out.join("\n")
}
