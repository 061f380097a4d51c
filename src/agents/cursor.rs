use super::traits::{LaunchContext, LaunchSpec};

/// Compose a cursor launch: `cursor-agent <user args>` with the hook
/// notify file and session id in the environment.
#[must_use]
pub fn compose(ctx: &LaunchContext<'_>) -> LaunchSpec {
    let mut spec = LaunchSpec::new("cursor-agent", ctx.user_args.to_vec());
    spec.env = vec![
        (
            "CURSOR_HOOK_NOTIFY_FILE".to_string(),
            ctx.notify_file.display().to_string(),
        ),
        (
            "CURSOR_HOOK_SESSION_ID".to_string(),
            ctx.session_id.to_string(),
        ),
    ];
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::traits::LaunchMode;
    use std::path::Path;

    #[test]
    fn test_compose_sets_hook_env() {
        let notify = Path::new("/tmp/cursor-notify.jsonl");
        let user_args = vec!["--resume".to_string()];
        let ctx = LaunchContext {
            session_id: "conversation-7",
            user_args: &user_args,
            launch_mode: LaunchMode::Standard,
            telemetry: None,
            resume_session_id: None,
            notify_file: notify,
        };

        let spec = compose(&ctx);
        assert_eq!(spec.program, "cursor-agent");
        assert_eq!(spec.args, vec!["--resume"]);
        assert!(spec.env.contains(&(
            "CURSOR_HOOK_NOTIFY_FILE".to_string(),
            "/tmp/cursor-notify.jsonl".to_string()
        )));
        assert!(spec.env.contains(&(
            "CURSOR_HOOK_SESSION_ID".to_string(),
            "conversation-7".to_string()
        )));
    }
}
