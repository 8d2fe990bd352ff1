/// Version string the agent reports to the intake.
///
/// The build's informational version may carry pre-release or metadata
/// suffixes; only the leading `MAJOR.MINOR.PATCH` part is reported.
pub(crate) fn agent_version() -> String {
    normalize(env!("CARGO_PKG_VERSION"))
}

/// Longest `MAJOR.MINOR.PATCH` prefix of `raw`, or `"0.0.0"` when `raw`
/// does not start with one.
pub(crate) fn normalize(raw: &str) -> String {
    let mut separators = 0;
    let mut in_component = false;
    let mut end = 0;

    for (idx, byte) in raw.bytes().enumerate() {
        match byte {
            b'0'..=b'9' => {
                in_component = true;
                end = idx + 1;
            }
            b'.' if in_component && separators < 2 => {
                separators += 1;
                in_component = false;
            }
            _ => break,
        }
    }

    if separators == 2 && in_component {
        raw[..end].to_owned()
    } else {
        "0.0.0".to_owned()
    }
}
