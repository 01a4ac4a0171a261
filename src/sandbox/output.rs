//! Output shaping for command results.
//!
//! Agents see every result in their context window, so very long output is
//! cut down to its head and tail around a marker line.

/// Text returned in place of an empty result.
pub const EMPTY_OUTPUT_PLACEHOLDER: &str = "[empty output]";

/// Line inserted between the kept head and tail of a truncated result.
pub const TRUNCATION_MARKER: &str = "[command output truncated]";

/// Prefix of the agent-facing wrapper produced by [`wrap_for_agent`].
pub const AGENT_WRAPPER_PREFIX: &str = "Command ran and generated the following output:";

const MAX_LINES_EACH: usize = 70;
const MAX_CHARS_EACH: usize = 3000;

/// Truncates `output` to a bounded head and tail.
///
/// Output of at most `2 * 3000` characters is returned unchanged. Longer
/// output keeps its first and last 70 lines when it has more than `2 * 70`
/// lines and those fit in the character budget; otherwise the first and last
/// 3000 characters are kept.
pub fn truncate(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_CHARS_EACH * 2 {
        return output.to_string();
    }

    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() > MAX_LINES_EACH * 2 {
        let head = lines[..MAX_LINES_EACH].join("\n");
        let tail = lines[lines.len() - MAX_LINES_EACH..].join("\n");
        if head.chars().count() + tail.chars().count() < MAX_CHARS_EACH * 2 {
            return format!("{head}\n{TRUNCATION_MARKER}\n{tail}");
        }
    }

    let head_end = byte_offset(output, MAX_CHARS_EACH);
    let tail_start = byte_offset(output, total - MAX_CHARS_EACH);
    format!(
        "{}\n{TRUNCATION_MARKER}\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Byte index of the `n`th character.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(idx, _)| idx)
}

/// Replaces empty output with the placeholder, then truncates.
pub fn normalize(output: &str) -> String {
    if output.is_empty() {
        EMPTY_OUTPUT_PLACEHOLDER.to_string()
    } else {
        truncate(output)
    }
}

/// Wraps a result in the fenced block agents expect, unless already wrapped.
pub fn wrap_for_agent(output: &str) -> String {
    if output.starts_with(AGENT_WRAPPER_PREFIX) {
        output.to_string()
    } else {
        format!("{AGENT_WRAPPER_PREFIX}\n```\n{output}\n```")
    }
}
