use super::traits::{LaunchContext, LaunchSpec};

/// Compose a plain shell launch: `$SHELL` (or `%ComSpec%`, or the platform
/// fallback) with the user args verbatim.
#[must_use]
pub fn compose(ctx: &LaunchContext<'_>) -> LaunchSpec {
    LaunchSpec::new(shell_program(), ctx.user_args.to_vec())
}

fn shell_program() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    if let Ok(comspec) = std::env::var("ComSpec") {
        if !comspec.is_empty() {
            return comspec;
        }
    }
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "sh".to_string()
    }
}
