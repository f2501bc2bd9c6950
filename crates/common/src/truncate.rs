//! Head/tail truncation for oversized tool output.
//!
//! Tool output is forwarded into the LLM transcript verbatim, so a single
//! chatty command can blow the context window. Anything past the cap keeps
//! the first and last halves with an explicit elision marker in between.

/// Maximum output forwarded to the transcript before elision kicks in.
pub const MAX_TOOL_OUTPUT_BYTES: usize = 100 * 1024;

/// Bytes kept from each end when eliding.
pub const KEEP_BYTES: usize = 50 * 1024;

/// Snap a byte index down to the nearest `char` boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index up to the nearest `char` boundary.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Human-readable size, KiB-granular above 1 KiB.
fn human_size(bytes: usize) -> String {
    if bytes >= 1024 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{bytes} B")
    }
}

/// Truncate `output` to at most [`MAX_TOOL_OUTPUT_BYTES`] plus marker,
/// keeping the first and last [`KEEP_BYTES`].
///
/// Returns the input unchanged when it fits. The marker names both the
/// original size and what was kept so the model knows content is missing.
#[must_use]
pub fn truncate_middle(output: &str) -> String {
    truncate_middle_with(output, MAX_TOOL_OUTPUT_BYTES, KEEP_BYTES)
}

/// [`truncate_middle`] with explicit limits, for callers with tighter caps.
#[must_use]
pub fn truncate_middle_with(output: &str, max_bytes: usize, keep_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }

    let head_end = floor_char_boundary(output, keep_bytes);
    let tail_start = ceil_char_boundary(output, output.len() - keep_bytes);

    let marker = format!(
        "\n\n... [{} total, showing first {} and last {}] ...\n\n",
        human_size(output.len()),
        human_size(head_end),
        human_size(output.len() - tail_start),
    );

    let mut result = String::with_capacity(head_end + marker.len() + (output.len() - tail_start));
    result.push_str(&output[..head_end]);
    result.push_str(&marker);
    result.push_str(&output[tail_start..]);
    result
}
