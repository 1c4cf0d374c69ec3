const DEFAULT_MAX_OUTPUT: usize = 256 * 1024; // 256KB
const BASH_MAX_OUTPUT: usize = 1024 * 1024; // 1MB

/// Max output size for a tool. Shell output is allowed to run longer.
pub fn max_output_for_tool(tool_name: &str) -> usize {
    match tool_name {
        "bash" => BASH_MAX_OUTPUT,
        _ => DEFAULT_MAX_OUTPUT,
    }
}

/// Truncate tool output at a char boundary, appending a size marker.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes);
    let truncated = &output[..boundary];
    format!(
        "{truncated}\n\n[truncated: {} bytes -> {} bytes]",
        output.len(),
        boundary
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
