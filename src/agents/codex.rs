use super::traits::{LaunchContext, LaunchMode, LaunchSpec};

/// Codex subcommands that suppress `--yolo` injection. A bare first
/// argument not in this list is still treated as a subcommand.
fn has_explicit_subcommand(args: &[String]) -> bool {
    args.first().is_some_and(|a| !a.starts_with('-'))
}

/// Compose a codex launch.
///
/// Injection order: `resume <id>` first (unless the user already supplied
/// `resume`), then the OTLP exporter and history overrides, then `--yolo`
/// in yolo mode, then the user args verbatim.
#[must_use]
pub fn compose(ctx: &LaunchContext<'_>) -> LaunchSpec {
    let mut args = Vec::new();

    let user_resumes = ctx.user_args.iter().any(|a| a == "resume");
    if let Some(resume_id) = ctx.resume_session_id {
        if !user_resumes {
            args.push("resume".to_string());
            args.push(resume_id.to_string());
        }
    }

    if let Some(telemetry) = &ctx.telemetry {
        args.push("-c".to_string());
        args.push(format!("otel.exporter=\"{}\"", telemetry.exporter_url));
        args.push("-c".to_string());
        args.push("history.persistence=\"save-all\"".to_string());
    } else {
        args.push("-c".to_string());
        args.push("history.persistence=\"none\"".to_string());
    }

    if ctx.launch_mode == LaunchMode::Yolo && !has_explicit_subcommand(ctx.user_args) {
        args.push("--yolo".to_string());
    }

    args.extend(ctx.user_args.iter().cloned());

    LaunchSpec::new("codex", args)
}
