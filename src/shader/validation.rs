//! WGSL validation using the naga library.

use anyhow::{Context, Result, anyhow};

/// Parse and validate WGSL source.
///
/// # Returns
/// The validated naga Module, or an error with the numbered source attached.
pub fn validate_wgsl(source: &str) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        anyhow!(
            "WGSL parse failed:\n{}",
            format_naga_error(source, &e.emit_to_string(source))
        )
    })?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| {
        anyhow!(
            "WGSL validation failed:\n{}",
            format_naga_error(source, &e.emit_to_string(source))
        )
    })?;

    Ok(module)
}

/// Validate WGSL and name the program that produced it.
pub fn validate_wgsl_with_context(source: &str, context: &str) -> Result<naga::Module> {
    validate_wgsl(source).with_context(|| format!("{} has invalid WGSL", context))
}

fn format_naga_error(source: &str, message: &str) -> String {
    let mut output = String::new();
    output.push_str(&format!("  {}\n", message.trim_end()));
    output.push_str("\nSource:\n---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}
