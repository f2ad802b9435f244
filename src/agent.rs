use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::Pid;
use serde::Deserialize;

use crate::error::AgentError;
use crate::types::TokenUsage;
use crate::{log_debug, log_warn};

// --- Shutdown signal ---

fn shutdown_handle() -> &'static Arc<AtomicBool> {
    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    SHUTDOWN.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_handle().load(Ordering::Relaxed)
}

/// Route SIGTERM and SIGINT into the shutdown flag. Call once at
/// program startup; calling again only re-registers.
pub fn install_signal_handlers() -> Result<(), String> {
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(shutdown_handle()))
            .map_err(|e| format!("Failed to register handler for signal {}: {}", signal, e))?;
    }
    Ok(())
}

// --- Live process groups ---

/// Process groups of agent subprocesses currently in flight, so a
/// forced shutdown can terminate everything the orchestrator spawned.
static LIVE_GROUPS: Mutex<Vec<i32>> = Mutex::new(Vec::new());

/// Registers a spawned process group and deregisters it again on drop,
/// so every exit path (result, timeout, wait error) removes the entry
/// exactly once.
struct GroupGuard {
    pgid: i32,
}

impl GroupGuard {
    fn new(pgid: i32) -> Self {
        if let Ok(mut groups) = LIVE_GROUPS.lock() {
            groups.push(pgid);
        }
        Self { pgid }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Ok(mut groups) = LIVE_GROUPS.lock() {
            groups.retain(|&p| p != self.pgid);
        }
    }
}

/// Grace a process group gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// SIGTERM a process group, wait out the grace window in small steps,
/// and SIGKILL whatever is left. Blocking; run it on the blocking pool
/// from async contexts.
fn terminate_group(pgid: i32, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};

    let pgid = Pid::from_raw(pgid);
    if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
        return; // already gone
    }

    let step = grace / 50;
    let mut waited = Duration::ZERO;
    while waited < grace {
        std::thread::sleep(step);
        waited += step;
        // killpg with a null signal probes for liveness.
        if matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)) {
            return;
        }
    }

    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Terminate every live agent process group, one at a time. Invoked
/// when the cooperative shutdown grace has expired.
pub fn kill_all_children() {
    let groups: Vec<i32> = match LIVE_GROUPS.lock() {
        Ok(groups) => groups.clone(),
        Err(_) => return,
    };
    for pgid in groups {
        terminate_group(pgid, TERM_GRACE);
    }
}

// --- Contract ---

/// Final result of one agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub output_text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Opaque session handle for resuming the conversation. Treated as
    /// write-only by the engine.
    pub session_key: Option<String>,
}

/// Runs agent turns. One real implementation wraps the agent CLI;
/// tests script a mock.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one turn. `session_key` resumes an existing conversation;
    /// `None` starts a fresh one.
    async fn run(
        &self,
        session_key: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentResponse, AgentError>;

    /// Abandon an in-flight session. Best-effort.
    async fn abort(&self, session_key: &str) -> Result<(), AgentError>;
}

// --- CLI implementation ---

/// Drives an agent CLI (`claude -p --output-format json`) as a
/// subprocess in its own process group, with timeout and
/// kill-with-grace.
pub struct CliAgentRunner {
    pub binary: String,
    pub model: Option<String>,
    /// Working directory for agent invocations (the task worktree).
    pub workdir: PathBuf,
}

/// Shape of the CLI's JSON result envelope. Unknown fields ignored.
#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    usage: CliUsage,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl CliAgentRunner {
    pub fn new(binary: &str, model: Option<String>, workdir: PathBuf) -> Self {
        Self {
            binary: binary.to_string(),
            model,
            workdir,
        }
    }

    /// Verify the configured agent binary is on PATH.
    pub fn verify_available(binary: &str) -> Result<(), String> {
        let output = std::process::Command::new(binary)
            .arg("--version")
            .output()
            .map_err(|e| format!("{} not found on PATH ({})", binary, e))?;
        if !output.status.success() {
            return Err(format!("{} found but `{} --version` failed", binary, binary));
        }
        Ok(())
    }

    fn build_args(&self, session_key: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = vec!["--dangerously-skip-permissions".to_string()];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(key) = session_key {
            args.push("--resume".to_string());
            args.push(key.to_string());
        }
        args.push("--output-format".to_string());
        args.push("json".to_string());
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(
        &self,
        session_key: Option<&str>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentResponse, AgentError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(self.build_args(session_key, prompt));
        cmd.current_dir(&self.workdir);
        run_subprocess_turn(cmd, timeout).await
    }

    async fn abort(&self, session_key: &str) -> Result<(), AgentError> {
        // The CLI has no session kill verb; abandoning the key is
        // enough — the subprocess for the turn is already gone or is
        // killed by the timeout path.
        log_debug!("[agent] abandoning session {}", session_key);
        Ok(())
    }
}

/// Spawn a subprocess turn, enforce the timeout, parse the JSON result
/// envelope from stdout.
///
/// The child runs in its own process group so a timeout can kill the
/// whole tree without touching the orchestrator.
pub async fn run_subprocess_turn(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<AgentResponse, AgentError> {
    // stdin MUST be null: with setpgid the child sits in a background
    // process group, and a terminal read would SIGTTIN-stop it silently.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: the closure runs in the forked child before exec, where
    // only async-signal-safe calls are allowed; setpgid is on that
    // list and nothing here allocates.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] spawning subprocess...");
    let child = cmd
        .spawn()
        .map_err(|e| AgentError::Transport(format!("failed to spawn agent: {}", e)))?;

    let child_pid = child
        .id()
        .ok_or_else(|| AgentError::Transport("failed to get child PID".to_string()))?
        as i32;
    // Tracked for the lifetime of the turn; dropped on every exit path.
    let _group = GroupGuard::new(child_pid);
    log_debug!("[agent] subprocess spawned (pid={})", child_pid);

    let wait_result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match wait_result {
        Err(_) => {
            log_debug!(
                "[agent] timeout after {}s, killing process group",
                timeout.as_secs()
            );
            let _ = tokio::task::spawn_blocking(move || terminate_group(child_pid, TERM_GRACE))
                .await;
            Err(AgentError::Timeout(timeout))
        }
        Ok(Err(e)) => Err(AgentError::Transport(format!(
            "error waiting for agent subprocess: {}",
            e
        ))),
        Ok(Ok(output)) => {
            if is_shutdown_requested() {
                return Err(AgentError::Transport("shutdown requested".to_string()));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if !output.status.success() {
                if looks_rate_limited(&stdout) || looks_rate_limited(&stderr) {
                    return Err(AgentError::RateLimited(first_line(&stderr, &stdout)));
                }
                // A failed exit can still carry a valid envelope; prefer
                // it when parsable.
                if let Ok(parsed) = parse_result_envelope(&stdout) {
                    log_warn!("agent exited non-zero but produced a valid result");
                    return Ok(parsed);
                }
                return Err(AgentError::Transport(format!(
                    "agent exited with {:?}: {}",
                    output.status.code(),
                    first_line(&stderr, &stdout)
                )));
            }

            parse_result_envelope(&stdout)
        }
    }
}

fn parse_result_envelope(stdout: &str) -> Result<AgentResponse, AgentError> {
    let parsed: CliResult = serde_json::from_str(stdout.trim()).map_err(|e| {
        AgentError::Protocol(format!("failed to parse agent result JSON: {}", e))
    })?;
    Ok(AgentResponse {
        output_text: parsed.result,
        usage: TokenUsage {
            input: parsed.usage.input_tokens,
            output: parsed.usage.output_tokens,
            cache_read: parsed.usage.cache_read_input_tokens,
            cache_write: parsed.usage.cache_creation_input_tokens,
        },
        cost_usd: parsed.total_cost_usd,
        session_key: parsed.session_id,
    })
}

fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded")
}

fn first_line(primary: &str, fallback: &str) -> String {
    primary
        .lines()
        .find(|l| !l.trim().is_empty())
        .or_else(|| fallback.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("(no output)")
        .trim()
        .to_string()
}

// --- Mock for tests ---

/// Scripted `AgentRunner`: each call pops the next result from the
/// sequence and records the prompt + session key it was given.
pub struct MockAgentRunner {
    results: tokio::sync::Mutex<Vec<Result<AgentResponse, AgentError>>>,
    pub calls: std::sync::Mutex<Vec<RecordedCall>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub session_key: Option<String>,
    pub prompt: String,
}

impl MockAgentRunner {
    /// Results are returned in order (first call gets the first result).
    pub fn new(results: Vec<Result<AgentResponse, AgentError>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// A response ending with the given output text and fixed usage.
    pub fn response(output: &str, session: &str) -> AgentResponse {
        AgentResponse {
            output_text: output.to_string(),
            usage: TokenUsage {
                input: 100,
                output: 50,
                cache_read: 10,
                cache_write: 5,
            },
            cost_usd: 0.01,
            session_key: Some(session.to_string()),
        }
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    async fn run(
        &self,
        session_key: Option<&str>,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.lock().unwrap().push(RecordedCall {
            session_key: session_key.map(|s| s.to_string()),
            prompt: prompt.to_string(),
        });
        let mut results = self.results.lock().await;
        results.pop().unwrap_or_else(|| {
            Err(AgentError::Transport(
                "MockAgentRunner: no more results in sequence".to_string(),
            ))
        })
    }

    async fn abort(&self, _session_key: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_guard_registers_and_deregisters() {
        let pgid = -424_242; // sentinel value no real group will use
        {
            let _guard = GroupGuard::new(pgid);
            assert!(LIVE_GROUPS.lock().unwrap().contains(&pgid));
        }
        assert!(!LIVE_GROUPS.lock().unwrap().contains(&pgid));
    }

    #[test]
    fn parses_result_envelope() {
        let json = r#"{
            "result": "did the thing\nMAESTRO_PHASE_COMPLETE",
            "session_id": "sess-abc",
            "total_cost_usd": 0.42,
            "usage": {
                "input_tokens": 1200,
                "output_tokens": 300,
                "cache_read_input_tokens": 800,
                "cache_creation_input_tokens": 100
            }
        }"#;
        let response = parse_result_envelope(json).unwrap();
        assert!(response.output_text.contains("did the thing"));
        assert_eq!(response.session_key.as_deref(), Some("sess-abc"));
        assert_eq!(response.usage.input, 1200);
        assert_eq!(response.usage.cache_write, 100);
        assert!((response.cost_usd - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn garbage_output_is_a_protocol_error() {
        let err = parse_result_envelope("not json at all").unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[test]
    fn rate_limit_detection() {
        assert!(looks_rate_limited("Error: rate limit exceeded"));
        assert!(looks_rate_limited("HTTP 429 Too Many Requests"));
        assert!(!looks_rate_limited("all good"));
    }

    #[test]
    fn cli_args_include_resume_and_model() {
        let runner = CliAgentRunner::new(
            "claude",
            Some("claude-sonnet-4".to_string()),
            PathBuf::from("/tmp/wt"),
        );
        let args = runner.build_args(Some("sess-1"), "do it");
        let joined = args.join(" ");
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--model claude-sonnet-4"));
        assert!(joined.contains("--output-format json"));
        assert!(joined.ends_with("-p do it"));

        let args = runner.build_args(None, "fresh");
        assert!(!args.join(" ").contains("--resume"));
    }

    #[tokio::test]
    async fn mock_replays_sequence_and_records_calls() {
        let mock = MockAgentRunner::new(vec![
            Ok(MockAgentRunner::response("one", "s1")),
            Ok(MockAgentRunner::response("two", "s1")),
        ]);
        let first = mock.run(None, "p1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.output_text, "one");
        let second = mock
            .run(Some("s1"), "p2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.output_text, "two");

        let calls = mock.recorded_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].session_key, None);
        assert_eq!(calls[1].session_key.as_deref(), Some("s1"));

        // Exhausted sequence errors.
        assert!(mock.run(None, "p3", Duration::from_secs(1)).await.is_err());
    }
}
