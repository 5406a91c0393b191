/// One entry of the `forbidden` config text. A trailing `!` in the config
/// makes the entry strict: it then only removes tags containing it as a
/// whole word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenPattern {
    pub pattern: String,
    pub strict: bool,
}

/// Parses comma- or newline-separated forbidden entries. Fullwidth `，` and
/// `！` are accepted.
pub fn parse_forbidden(input: &str) -> Vec<ForbiddenPattern> {
    let normalized = input
        .trim()
        .to_lowercase()
        .replace('，', ",")
        .replace('！', "!");

    normalized
        .split([',', '\n'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (entry, strict) = match entry.strip_suffix('!') {
                Some(rest) => (rest, true),
                None => (entry, false),
            };
            let pattern = collapse(entry, |ch| {
                ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch >= '\u{ff}'
            });
            (!pattern.is_empty()).then_some(ForbiddenPattern { pattern, strict })
        })
        .collect()
}

/// Lower-cases a tag and turns ASCII punctuation into single spaces, which is
/// the form forbidden patterns are matched against.
pub fn normalize_tag(tag: &str) -> String {
    collapse(&tag.to_lowercase(), |ch| !ch.is_ascii() || ch.is_ascii_alphanumeric())
}

/// `tag` must already be in `normalize_tag` form.
pub fn is_forbidden(tag: &str, patterns: &[ForbiddenPattern]) -> bool {
    patterns.iter().any(|ForbiddenPattern { pattern, strict }| {
        if *strict {
            tag.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .any(|word| word == pattern.as_str())
        } else {
            tag.contains(pattern.as_str())
        }
    })
}

/// Replaces every run of characters failing `keep` with one space and trims.
fn collapse(input: &str, keep: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if keep(ch) {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else {
            pending_space = true;
        }
    }
    out
}
