//! System prompt assembly.

use super::types::ClientContext;

const FALLBACK_PROMPT: &str = "You are an operations assistant for a monitoring platform. \
Answer concisely. Use the provided tools when they can answer the question.";

const SUMMARY_INSTRUCTION: &str = "Summarise the tool results above for the user. \
If a tool failed, say what failed and why. Do not invent data the tools did not return.";

/// Agent prompt followed by a block describing the caller's context.
pub fn build_system_prompt(agent_prompt: &str, ctx: &ClientContext) -> String {
    let mut prompt = if agent_prompt.trim().is_empty() {
        FALLBACK_PROMPT.to_string()
    } else {
        agent_prompt.trim().to_string()
    };

    let mut lines = Vec::new();
    if let Some(env) = ctx.env.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("- Environment: {env}"));
    }
    if let Some(tz) = ctx.user_timezone.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("- User timezone: {tz}"));
    }
    if let Some(lang) = ctx.ui_language.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("- Reply in the UI language: {lang}"));
    }
    if let Some(group) = ctx.busi_group_id.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("- Business group: {group}"));
    }
    if !lines.is_empty() {
        prompt.push_str("\n\n## Client context\n");
        prompt.push_str(&lines.join("\n"));
    }
    prompt
}

/// Prompt for the second LLM call that turns tool output into an answer.
pub fn build_summary_prompt(agent_prompt: &str, ctx: &ClientContext) -> String {
    format!("{}\n\n{SUMMARY_INSTRUCTION}", build_system_prompt(agent_prompt, ctx))
}

/// Human-readable line for a pending confirmation.
pub fn confirmation_summary(tool: &str, args: &serde_json::Value, reasons: &[String]) -> String {
    let args = serde_json::to_string(args).unwrap_or_default();
    if reasons.is_empty() {
        format!("即将执行高风险操作 {tool}，参数: {args}")
    } else {
        format!("即将执行高风险操作 {tool}（{}），参数: {args}", reasons.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_block_only_when_present() {
        let plain = build_system_prompt("You are a DBA.", &ClientContext::default());
        assert_eq!(plain, "You are a DBA.");

        let ctx = ClientContext {
            env: Some("prod".into()),
            user_timezone: Some("Asia/Shanghai".into()),
            ui_language: Some("zh_CN".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt("You are a DBA.", &ctx);
        assert!(prompt.starts_with("You are a DBA."));
        assert!(prompt.contains("Environment: prod"));
        assert!(prompt.contains("Asia/Shanghai"));
        assert!(prompt.contains("zh_CN"));
    }

    #[test]
    fn test_empty_agent_prompt_uses_fallback() {
        assert!(build_system_prompt("  ", &ClientContext::default()).contains("operations assistant"));
    }

    #[test]
    fn test_confirmation_summary_lists_reasons() {
        let s = confirmation_summary(
            "run_sql",
            &serde_json::json!({"sql": "DROP TABLE t;"}),
            &["destructive SQL (DROP)".into()],
        );
        assert!(s.contains("run_sql"));
        assert!(s.contains("DROP"));
    }
}
