//! Assistant profiles: the per-CLI pattern tables consulted by the match
//! engine and auto-responder.
//!
//! A profile is plain data. There is no trait or dispatch on the assistant
//! itself; every supervised CLI is described by the same record.

use anyhow::{anyhow, Result};
use regex::Regex;

/// Where the initial prompt lands in the assistant's argv.
#[derive(Debug, Clone)]
pub enum PromptArg {
    /// Prompt becomes the first positional argument.
    First,
    /// Prompt becomes the last positional argument.
    Last,
    /// Prompt follows the given flag (e.g. `-i <prompt>`).
    Flag(String),
}

/// Configuration for one supervised assistant CLI.
#[derive(Debug, Clone)]
pub struct AssistantProfile {
    /// Binary name when it differs from the CLI name.
    pub binary: Option<String>,
    /// How the initial prompt is passed.
    pub prompt_arg: PromptArg,
    /// Patterns meaning "interactive prompt visible, ready for input".
    pub ready: Vec<Regex>,
    /// Patterns meaning "awaiting a yes/no confirmation".
    pub confirm: Vec<Regex>,
    /// Patterns meaning "awaiting a destructive-action confirmation".
    /// These are never answered automatically.
    pub dangerous: Vec<Regex>,
    /// Key sequence sent to accept a non-dangerous confirmation.
    pub reply_keys: String,
    /// Arguments always appended to the assistant's argv.
    pub default_args: Vec<String>,
    /// Shown when the binary is missing.
    pub install_hint: Option<String>,
}

impl AssistantProfile {
    /// Build the full command line: `[binary, args...]`.
    ///
    /// Order matches what the assistant expects: caller-supplied extra args,
    /// the prompt placed per `prompt_arg`, then the profile's default args.
    pub fn build_command(&self, cli: &str, extra: &[String], prompt: Option<&str>) -> Vec<String> {
        let binary = self.binary.clone().unwrap_or_else(|| cli.to_string());
        let mut args = extra.to_vec();

        if let Some(prompt) = prompt {
            match &self.prompt_arg {
                PromptArg::First => args.insert(0, prompt.to_string()),
                PromptArg::Last => args.push(prompt.to_string()),
                PromptArg::Flag(flag) => {
                    args.push(flag.clone());
                    args.push(prompt.to_string());
                }
            }
        }

        args.extend(self.default_args.iter().cloned());

        let mut command = vec![binary];
        command.extend(args);
        command
    }
}

/// Look up the built-in profile for a CLI name.
pub fn get_profile(cli: &str) -> Result<AssistantProfile> {
    match cli {
        "claude" => Ok(claude_profile()),
        "codex" => Ok(codex_profile()),
        "gemini" => Ok(gemini_profile()),
        "copilot" => Ok(copilot_profile()),
        "cursor" => Ok(cursor_profile()),
        "default" => Ok(default_profile()),
        _ => Err(anyhow!("unknown assistant CLI: {}", cli)),
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern must compile")
}

/// Destructive-action patterns shared by the built-in profiles.
fn common_dangerous() -> Vec<Regex> {
    vec![re(r"rm -rf"), re(r"sudo rm"), re(r"git push --force"), re(r"DROP TABLE")]
}

fn claude_profile() -> AssistantProfile {
    AssistantProfile {
        binary: None,
        prompt_arg: PromptArg::Last,
        ready: vec![
            re(r"\? for shortcuts"),
            re(r"\u{00A0}Try "),
            re(r"(?m)^>[ \u{00A0}]"),
            re(r"─{10,}"),
        ],
        confirm: vec![
            re(r" > 1\. Yes, I trust this folder"),
            re(r"❯ ?1\. ?Dark mode"),
            re(r"❯ ?1\. ?Yes"),
            re(r"(?m)^.{0,4} ?1\. ?Yes"),
            re(r"Press Enter to continue"),
        ],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec![],
        install_hint: Some("npm i -g @anthropic-ai/claude-code@latest".to_string()),
    }
}

fn codex_profile() -> AssistantProfile {
    AssistantProfile {
        binary: None,
        prompt_arg: PromptArg::First,
        ready: vec![re(r"⏎ send"), re(r"\? for shortcuts")],
        confirm: vec![
            re(r"[›>] 1\. Yes,"),
            re(r"[›>] 1\. Approve and run now"),
        ],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec!["--search".to_string()],
        install_hint: Some("npm install -g @openai/codex@latest".to_string()),
    }
}

fn gemini_profile() -> AssistantProfile {
    AssistantProfile {
        binary: None,
        prompt_arg: PromptArg::Last,
        ready: vec![re(r"Type your message")],
        confirm: vec![
            re(r"│ ● 1\. Yes, allow once"),
            re(r"│ ● 1\. Allow once"),
        ],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec![],
        install_hint: Some("npm install -g @google/gemini-cli@latest".to_string()),
    }
}

fn copilot_profile() -> AssistantProfile {
    AssistantProfile {
        binary: None,
        prompt_arg: PromptArg::Flag("-i".to_string()),
        ready: vec![re(r"(?m)^ +> "), re(r"Ctrl\+c Exit")],
        confirm: vec![re(r" │ ❯ +1\. Yes, proceed"), re(r" ❯ +1\. Yes")],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec![],
        install_hint: Some("npm install -g @github/copilot".to_string()),
    }
}

fn cursor_profile() -> AssistantProfile {
    AssistantProfile {
        binary: Some("cursor-agent".to_string()),
        prompt_arg: PromptArg::Last,
        ready: vec![re(r"/ commands")],
        confirm: vec![
            re(r"→ Run \(once\) \(y\) \(enter\)"),
            re(r"▶ \[a\] Trust this workspace"),
        ],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec![],
        install_hint: Some("open https://cursor.com/docs/cli/installation".to_string()),
    }
}

/// Generic profile for arbitrary line-oriented tools: a bare shell-style
/// prompt means ready, nothing is ever auto-confirmed.
fn default_profile() -> AssistantProfile {
    AssistantProfile {
        binary: None,
        prompt_arg: PromptArg::Last,
        ready: vec![re(r"(?m)^[>$%#] $")],
        confirm: vec![],
        dangerous: common_dangerous(),
        reply_keys: "\n".to_string(),
        default_args: vec![],
        install_hint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_profile_known() {
        let profile = get_profile("claude").unwrap();
        assert!(!profile.ready.is_empty());
        assert!(!profile.confirm.is_empty());
        assert_eq!(profile.reply_keys, "\n");
    }

    #[test]
    fn test_get_profile_unknown() {
        assert!(get_profile("no-such-cli").is_err());
    }

    #[test]
    fn test_claude_patterns() {
        let profile = get_profile("claude").unwrap();
        assert!(profile.ready[0].is_match("? for shortcuts"));
        assert!(profile.confirm[2].is_match("❯ 1. Yes"));
        assert!(profile.dangerous[0].is_match("About to run rm -rf /tmp/x"));
    }

    #[test]
    fn test_build_command_prompt_last() {
        let profile = get_profile("claude").unwrap();
        let cmd = profile.build_command("claude", &["--model".into(), "opus".into()], Some("fix it"));
        assert_eq!(cmd, vec!["claude", "--model", "opus", "fix it"]);
    }

    #[test]
    fn test_build_command_prompt_flag() {
        let profile = get_profile("copilot").unwrap();
        let cmd = profile.build_command("copilot", &[], Some("hello"));
        assert_eq!(cmd, vec!["copilot", "-i", "hello"]);
    }

    #[test]
    fn test_build_command_default_args_appended() {
        let profile = get_profile("codex").unwrap();
        let cmd = profile.build_command("codex", &[], Some("task"));
        assert_eq!(cmd, vec!["codex", "task", "--search"]);
    }

    #[test]
    fn test_cursor_binary_override() {
        let profile = get_profile("cursor").unwrap();
        let cmd = profile.build_command("cursor", &[], None);
        assert_eq!(cmd[0], "cursor-agent");
    }
}
