// Line classification for assembly source.

/// One source line reduced to its structural form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLineKind {
    /// Empty line, or nothing left after comment removal.
    Blank,
    /// Label definition (`name:`).
    Label(String),
    /// Directive (`.name arg, arg`).
    Directive { name: String, args: Vec<String> },
    /// Instruction (`mnemonic arg, arg`).
    Instruction { mnemonic: String, args: Vec<String> },
}

/// Classify one raw source line.
///
/// Strips a trailing comment (a `#` not inside a double-quoted string),
/// collapses tabs to spaces, and trims surrounding whitespace before
/// deciding the line form. Argument strings are split on commas outside
/// quotes and returned trimmed.
pub fn classify(raw: &str) -> SourceLineKind {
    let line = strip_comment(raw).replace('\t', " ");
    let line = line.trim();

    if line.is_empty() {
        return SourceLineKind::Blank;
    }
    if let Some(name) = line.strip_suffix(':') {
        return SourceLineKind::Label(name.trim_end_matches(':').to_string());
    }
    if let Some(rest) = line.strip_prefix('.') {
        let (name, args) = split_name_and_args(rest);
        return SourceLineKind::Directive { name, args };
    }
    let (mnemonic, args) = split_name_and_args(line);
    SourceLineKind::Instruction { mnemonic, args }
}

/// Return `line` with any trailing comment removed.
fn strip_comment(line: &str) -> &str {
    for (idx, ch) in line.char_indices() {
        if ch == '#' && !is_char_enclosed(idx, line) {
            return &line[..idx];
        }
    }
    line
}

/// True if the character at `idx` lies inside a double-quoted string.
///
/// An odd number of quotes between the position and the end of the line
/// means the position sits inside a quote pair.
fn is_char_enclosed(idx: usize, line: &str) -> bool {
    let quotes = line[idx..].bytes().filter(|&b| b == b'"').count();
    quotes % 2 == 1
}

/// Split a name from its comma-separated argument list.
fn split_name_and_args(line: &str) -> (String, Vec<String>) {
    let (name, rest) = match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    };
    (name.to_string(), split_args(rest))
}

/// Split an argument string on commas that are not enclosed in quotes.
fn split_args(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Vec::new();
    }
    split_outside_quotes(rest, ',')
        .into_iter()
        .map(|arg| arg.trim().to_string())
        .collect()
}

/// Split `text` on `delimiter` occurrences that are not inside a
/// double-quoted substring.
pub(crate) fn split_outside_quotes(text: &str, delimiter: char) -> Vec<String> {
    let mut segments = Vec::new();
    let mut segment = String::new();
    for (idx, ch) in text.char_indices() {
        if ch == delimiter && !is_char_enclosed(idx, text) {
            segments.push(std::mem::take(&mut segment));
        } else {
            segment.push(ch);
        }
    }
    segments.push(segment);
    segments
}
