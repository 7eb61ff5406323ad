use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Build the wrapper script every backend ships alongside the user command.
/// The command arrives base64-encoded so it survives shell-quoting across
/// whichever transport a backend uses (pod spec, batch script, HTTP body),
/// then is decoded and `eval`'d, with the exit code captured and echoed on
/// a line the backend's log scraper can find.
pub fn build_wrapper_script(cmd: &str) -> String {
    let encoded = STANDARD.encode(cmd.as_bytes());
    format!(
        "#!/bin/sh\nset -o pipefail\nCMD=$(echo '{encoded}' | base64 -d)\neval \"$CMD\"\nexit_code=$?\necho \"[job-controller] exit_code=$exit_code\"\nexit $exit_code\n"
    )
}
