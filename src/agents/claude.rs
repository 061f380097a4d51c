use super::traits::{LaunchContext, LaunchSpec};

/// Hook events registered in the injected settings payload.
const HOOK_EVENTS: &[&str] = &[
    "UserPromptSubmit",
    "PreToolUse",
    "PostToolUse",
    "Stop",
    "Notification",
];

/// Compose a claude launch: `claude --settings <json> <user args>` where
/// the settings register hooks that append their stdin JSON to the
/// session's notify file.
#[must_use]
pub fn compose(ctx: &LaunchContext<'_>) -> LaunchSpec {
    let mut args = vec!["--settings".to_string(), hook_settings(ctx)];
    args.extend(ctx.user_args.iter().cloned());
    LaunchSpec::new("claude", args)
}

fn hook_settings(ctx: &LaunchContext<'_>) -> String {
    let sink = format!("cat >> '{}'", ctx.notify_file.display());
    let entry = serde_json::json!([{
        "hooks": [{ "type": "command", "command": sink }]
    }]);

    let mut hooks = serde_json::Map::new();
    for event in HOOK_EVENTS {
        hooks.insert((*event).to_string(), entry.clone());
    }

    serde_json::json!({ "hooks": hooks }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::traits::LaunchMode;
    use std::path::Path;

    #[test]
    fn test_compose_registers_all_hooks() {
        let notify = Path::new("/tmp/claude-notify.jsonl");
        let user_args = vec!["--continue".to_string()];
        let ctx = LaunchContext {
            session_id: "conversation-1",
            user_args: &user_args,
            launch_mode: LaunchMode::Standard,
            telemetry: None,
            resume_session_id: None,
            notify_file: notify,
        };

        let spec = compose(&ctx);
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args[0], "--settings");

        let settings: serde_json::Value = serde_json::from_str(&spec.args[1]).unwrap();
        for event in HOOK_EVENTS {
            let command = settings["hooks"][*event][0]["hooks"][0]["command"]
                .as_str()
                .unwrap();
            assert!(command.contains("claude-notify.jsonl"), "{event}: {command}");
        }
        assert_eq!(spec.args[2], "--continue");
    }
}
