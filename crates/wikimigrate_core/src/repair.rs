use once_cell::sync::Lazy;
use regex::Regex;

/// Known failure signatures emitted by the conversion engine, in the order
/// they are checked. Everything else is `Unclassified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticClass {
    UnexpectedEndOfInput,
    UnexpectedEquals,
    UnexpectedCloseBrace,
    Unclassified,
}

/// All knowledge of the engine's diagnostic wording lives here; the repair
/// passes only ever look at the returned class.
pub fn classify(diagnostics: &str) -> DiagnosticClass {
    if diagnostics.contains("unexpected end of input") {
        DiagnosticClass::UnexpectedEndOfInput
    } else if diagnostics.contains("unexpected \"=\"") {
        DiagnosticClass::UnexpectedEquals
    } else if diagnostics.contains("unexpected \"}\"") {
        DiagnosticClass::UnexpectedCloseBrace
    } else {
        DiagnosticClass::Unclassified
    }
}

static RE_DIAGNOSTIC_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"line (\d+),").unwrap());

static RE_PRETTYTABLE_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{prettytable\}\} width=.+%").unwrap());

/// One-based line number carried in a diagnostic, if any.
pub fn diagnostic_line_number(diagnostics: &str) -> Option<usize> {
    RE_DIAGNOSTIC_LINE
        .captures(diagnostics)
        .and_then(|caps| caps.get(1))
        .and_then(|group| group.as_str().parse::<usize>().ok())
}

/// Scanner state for the table-row pass. Transitions happen per line: a
/// table opener switches to `InsideTable`, a table closer back to `Outside`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableScan {
    Outside,
    InsideTable,
}

/// Produce a patched copy of `source` that the engine gets to retry.
///
/// Always applies the template-width strip and the table-row header pass,
/// then one repair targeted at the diagnostic class. Unknown diagnostics
/// and out-of-range line numbers leave the targeted stage a no-op.
pub fn repair(source: &str, diagnostics: &str) -> String {
    let stripped = RE_PRETTYTABLE_WIDTH.replace_all(source, "{{prettytable}}");
    let mut lines: Vec<String> = stripped.split('\n').map(str::to_string).collect();
    patch_table_rows(&mut lines);

    match classify(diagnostics) {
        DiagnosticClass::UnexpectedEndOfInput => {
            let document = lines.join("\n");
            if has_unterminated(&document, "<pre>", "</pre>") {
                lines.push("\n</pre>".to_string());
            } else if has_unterminated(&document, "{|", "|}") {
                lines.push("\n|}".to_string());
            }
        }
        DiagnosticClass::UnexpectedEquals => {
            if let Some(index) = resolve_line_index(diagnostics, lines.len()) {
                lines.remove(index);
            }
        }
        DiagnosticClass::UnexpectedCloseBrace => {
            if let Some(index) = resolve_line_index(diagnostics, lines.len()) {
                lines[index] = lines[index].replacen('}', "|}", 1);
            }
        }
        DiagnosticClass::Unclassified => {}
    }

    lines.join("\n")
}

/// Rewrite the first pipe of bare table rows into a header marker. Lines
/// carrying a table opener or closer, or already holding a `!`, stay as
/// they are.
fn patch_table_rows(lines: &mut [String]) {
    let mut state = TableScan::Outside;
    for line in lines.iter_mut() {
        if line.contains("{|") {
            state = TableScan::InsideTable;
        } else if line.contains("|}") {
            state = TableScan::Outside;
        }
        if state == TableScan::InsideTable
            && !line.contains("{|")
            && !line.contains("|}")
            && !line.contains('!')
        {
            *line = line.replacen('|', "!", 1);
        }
    }
}

fn has_unterminated(document: &str, open: &str, close: &str) -> bool {
    match document.rfind(open) {
        Some(position) => !document[position + open.len()..].contains(close),
        None => false,
    }
}

fn resolve_line_index(diagnostics: &str, line_count: usize) -> Option<usize> {
    let number = diagnostic_line_number(diagnostics)?;
    let index = number.checked_sub(1)?;
    if index < line_count { Some(index) } else { None }
}
