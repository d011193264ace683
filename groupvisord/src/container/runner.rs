//! Worker supervisor: spawns one worker per run and sees it through to exit.
//!
//! A run writes a single input line, streams stdout through the marker
//! parser, forwards every envelope as it arrives, and returns the last one.
//! A global timeout bounds the whole run; after stdout closes the process
//! gets a short grace period before it is killed.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use groupvisor_core::{
    BlockEvent, Group, GroupvisorConfig, OutputBlockParser, VolumeMount, WorkerInput, WorkerOutput,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::CONTAINER_NAME_PREFIX;
use super::command::{LaunchSpec, build_container_args};
use super::mounts::{MountPaths, build_volume_mounts, container_name};
use super::security::MountValidator;

/// Receives every envelope as soon as it is parsed.
pub type OutputCallback = Arc<dyn Fn(WorkerOutput) -> BoxFuture<'static, ()> + Send + Sync>;

/// How much of each stream is kept for the run log.
const LOG_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Per-block cap for bytes between output markers.
    pub max_output_bytes: usize,
    /// Envelopes handed to the callback; the rest still count and update
    /// the final result.
    pub max_envelopes: usize,
    pub exit_grace: Duration,
}

/// Names the container behind a client process so a timeout can stop it.
#[derive(Debug, Clone, Copy)]
pub struct ContainerStop<'a> {
    pub runtime_bin: &'a str,
    pub name: &'a str,
}

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    /// Last envelope, or a synthesized error.
    pub output: WorkerOutput,
    pub envelopes: usize,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl SupervisedRun {
    fn failed(start: Instant, message: String) -> Self {
        Self {
            output: WorkerOutput::error(message),
            envelopes: 0,
            exit_code: None,
            timed_out: false,
            duration: start.elapsed(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        }
    }
}

/// Keeps the last `cap` bytes written to it.
#[derive(Debug)]
struct Tail {
    buf: String,
    cap: usize,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push(&mut self, s: &str) {
        self.buf.push_str(s);
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }
}

fn last_chars(s: &str, n: usize) -> &str {
    let s = s.trim_end();
    match s.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) if n > 0 => &s[idx..],
        _ => s,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    /// The line ran past the cap. Holds its full length; only the first
    /// `cap` bytes were kept.
    Overlong(usize),
}

/// Read one line into `buf`, keeping at most `cap` bytes. The rest of an
/// overlong line is consumed and dropped up to the next newline.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<LineRead> {
    let mut total = 0usize;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(match total {
                0 => LineRead::Eof,
                n if n > cap => LineRead::Overlong(n),
                _ => LineRead::Line,
            });
        }
        let (used, done) = match chunk.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..used.min(room)]);
        reader.consume(used);
        total += used;
        if done {
            return Ok(if total > cap {
                LineRead::Overlong(total)
            } else {
                LineRead::Line
            });
        }
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(stream: R) -> String {
    let mut reader = BufReader::new(stream);
    let mut tail = Tail::new(LOG_TAIL_BYTES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, LOG_TAIL_BYTES).await {
            Ok(LineRead::Eof) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!(target: "worker", "{trimmed}");
                }
                tail.push(&line);
            }
        }
    }
    tail.buf
}

/// Wait for exit, killing the process if it outlives `grace`.
async fn reap(child: &mut Child, grace: Duration) -> Option<i32> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(err = %e, "failed to wait for worker exit");
            None
        }
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "worker still running after output closed, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(err = %e, "failed to kill worker");
            }
            None
        }
    }
}

/// Run one worker process to completion. Never fails: every problem is
/// reported as an error envelope in the returned run.
pub async fn supervise(
    mut command: Command,
    input: &WorkerInput,
    limits: &RunLimits,
    stop: Option<ContainerStop<'_>>,
    on_output: Option<&OutputCallback>,
) -> SupervisedRun {
    let start = Instant::now();

    let payload = match serde_json::to_string(input) {
        Ok(json) => json + "\n",
        Err(e) => return SupervisedRun::failed(start, format!("Failed to encode worker input: {e}")),
    };

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(err = %e, "failed to spawn worker");
            return SupervisedRun::failed(start, format!("Failed to spawn worker: {e}"));
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            warn!(err = %e, "failed to write worker input");
        }
        // Dropping stdin closes it; follow-ups go through the mailbox.
    }

    let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain_stderr(s)));
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return SupervisedRun::failed(start, "Worker stdout unavailable".to_string());
    };

    let mut reader = BufReader::new(stdout);
    let mut parser = OutputBlockParser::new(limits.max_output_bytes);
    let mut stdout_tail = Tail::new(LOG_TAIL_BYTES);
    let mut last: Option<WorkerOutput> = None;
    let mut envelopes = 0usize;
    let mut timed_out = false;
    let deadline = tokio::time::Instant::now() + limits.timeout;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        tokio::select! {
            read = read_line_capped(&mut reader, &mut buf, limits.max_output_bytes) => match read {
                Ok(LineRead::Eof) => break,
                Ok(read) => {
                    let line = String::from_utf8_lossy(&buf);
                    stdout_tail.push(&line);
                    let event = match read {
                        LineRead::Overlong(bytes) => {
                            debug!(bytes, "worker stdout line over size cap, truncated");
                            parser.overlong_line(bytes)
                        }
                        _ => parser.feed(&line),
                    };
                    match event {
                        Some(BlockEvent::Envelope(output)) => {
                            envelopes += 1;
                            if envelopes <= limits.max_envelopes {
                                if let Some(callback) = on_output {
                                    callback(output.clone()).await;
                                }
                            } else if envelopes == limits.max_envelopes + 1 {
                                warn!(
                                    max_envelopes = limits.max_envelopes,
                                    "envelope cap reached, no longer forwarding output"
                                );
                            }
                            last = Some(output);
                        }
                        Some(BlockEvent::Malformed(err)) => {
                            warn!(err = %err, "discarding malformed output block");
                        }
                        Some(BlockEvent::Overflow { bytes }) => {
                            warn!(
                                bytes,
                                max_bytes = limits.max_output_bytes,
                                "output block over size cap, abandoned"
                            );
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    warn!(err = %e, "error reading worker stdout");
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
        }
    }
    if parser.in_block() {
        warn!("worker output ended inside an open block");
    }

    let exit_code = if timed_out {
        error!(
            timeout_ms = limits.timeout.as_millis() as u64,
            envelopes, "worker timed out, stopping"
        );
        if let Some(stop) = stop {
            stop_container(stop.runtime_bin, stop.name).await;
        }
        if let Err(e) = child.kill().await {
            warn!(err = %e, "failed to kill timed out worker");
        }
        None
    } else {
        reap(&mut child, limits.exit_grace).await
    };

    let stderr_tail = match stderr_task {
        Some(handle) => match tokio::time::timeout(Duration::from_secs(1), handle).await {
            Ok(Ok(tail)) => tail,
            _ => String::new(),
        },
        None => String::new(),
    };

    let output = match (timed_out, last) {
        (true, last) => {
            let mut output = WorkerOutput::error(format!(
                "Worker timed out after {}ms",
                limits.timeout.as_millis()
            ));
            output.new_session_id = last.and_then(|o| o.new_session_id);
            output
        }
        (false, Some(last)) => last,
        (false, None) => match exit_code {
            Some(code) if code != 0 => WorkerOutput::error(format!(
                "No output received (exit code {code}): {}",
                last_chars(&stderr_tail, 200)
            )),
            _ => WorkerOutput::error("No output received"),
        },
    };

    SupervisedRun {
        output,
        envelopes,
        exit_code,
        timed_out,
        duration: start.elapsed(),
        stdout_tail: stdout_tail.buf,
        stderr_tail,
    }
}

/// Static settings for container launches.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runtime_bin: String,
    pub image: String,
    pub timezone: String,
    pub limits: RunLimits,
    pub paths: MountPaths,
}

impl SupervisorConfig {
    pub fn from_config(config: &GroupvisorConfig) -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| ".".into());
        Self {
            runtime_bin: config.container.runtime_bin.clone(),
            image: config.container.image.clone(),
            timezone: config.scheduler.timezone.clone(),
            limits: RunLimits {
                timeout: Duration::from_millis(config.container.timeout_ms),
                max_output_bytes: config.container.max_output_bytes,
                max_envelopes: config.container.max_envelopes,
                exit_grace: Duration::from_millis(config.container.exit_grace_ms),
            },
            paths: MountPaths {
                project_root,
                groups_dir: config.groups_dir(),
                ipc_dir: config.ipc_dir(),
                store_dir: config.storage.store_dir.clone().into(),
            },
        }
    }
}

/// A launch whose name and sandbox are fixed, so the caller can register
/// the process with the queue before it starts.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub container_name: String,
    pub group_folder: String,
    pub group_name: String,
    pub mounts: Vec<VolumeMount>,
    args: Vec<String>,
    limits: RunLimits,
}

pub struct ContainerSupervisor {
    config: SupervisorConfig,
    validator: Arc<MountValidator>,
}

impl ContainerSupervisor {
    pub fn new(config: SupervisorConfig, validator: Arc<MountValidator>) -> Self {
        Self { config, validator }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn prepare(&self, group: &Group, is_main: bool) -> PreparedRun {
        let mounts = build_volume_mounts(group, is_main, &self.config.paths, &self.validator);
        let name = container_name(&group.folder);
        let args = build_container_args(&LaunchSpec {
            container_name: &name,
            image: &self.config.image,
            timezone: &self.config.timezone,
            group_folder: &group.folder,
            is_main,
            mounts: &mounts,
        });

        let mut limits = self.config.limits.clone();
        if let Some(ms) = group.container_config.as_ref().and_then(|c| c.timeout_ms) {
            limits.timeout = Duration::from_millis(ms);
        }

        PreparedRun {
            container_name: name,
            group_folder: group.folder.clone(),
            group_name: group.name.clone(),
            mounts,
            args,
            limits,
        }
    }

    pub async fn execute(
        &self,
        prepared: &PreparedRun,
        input: &WorkerInput,
        on_output: Option<OutputCallback>,
    ) -> WorkerOutput {
        info!(
            group = %prepared.group_name,
            container = %prepared.container_name,
            mounts = prepared.mounts.len(),
            is_main = input.is_main,
            "spawning worker"
        );

        let mut command = Command::new(&self.config.runtime_bin);
        command.args(&prepared.args);
        let run = supervise(
            command,
            input,
            &prepared.limits,
            Some(ContainerStop {
                runtime_bin: &self.config.runtime_bin,
                name: &prepared.container_name,
            }),
            on_output.as_ref(),
        )
        .await;

        let logs_dir = self
            .config
            .paths
            .groups_dir
            .join(&prepared.group_folder)
            .join("logs");
        write_run_log(&logs_dir, prepared, &run).await;

        if run.output.is_error() {
            error!(
                group = %prepared.group_name,
                exit_code = ?run.exit_code,
                timed_out = run.timed_out,
                duration_ms = run.duration.as_millis() as u64,
                err = run.output.error.as_deref().unwrap_or(""),
                "worker run failed"
            );
        } else {
            info!(
                group = %prepared.group_name,
                envelopes = run.envelopes,
                duration_ms = run.duration.as_millis() as u64,
                "worker completed"
            );
        }
        run.output
    }

    /// Prepare and execute in one step.
    pub async fn run(
        &self,
        group: &Group,
        input: &WorkerInput,
        on_output: Option<OutputCallback>,
    ) -> WorkerOutput {
        let prepared = self.prepare(group, input.is_main);
        self.execute(&prepared, input, on_output).await
    }
}

async fn write_run_log(logs_dir: &Path, prepared: &PreparedRun, run: &SupervisedRun) {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let log_file = logs_dir.join(format!("worker-{timestamp}.log"));
    let failed = run.output.is_error();

    let mut lines = vec![
        format!(
            "=== Worker Run Log{} ===",
            if run.timed_out { " (TIMEOUT)" } else { "" }
        ),
        format!("Timestamp: {timestamp}"),
        format!("Group: {}", prepared.group_name),
        format!("Container: {}", prepared.container_name),
        format!("Duration: {}ms", run.duration.as_millis()),
        format!("Exit Code: {:?}", run.exit_code),
        format!("Timed Out: {}", run.timed_out),
        format!("Envelopes: {}", run.envelopes),
        String::new(),
        "=== Mounts ===".to_string(),
    ];
    for m in &prepared.mounts {
        let ro = if m.readonly { " (ro)" } else { "" };
        if failed {
            lines.push(format!("{} -> {}{ro}", m.host_path, m.container_path));
        } else {
            lines.push(format!("{}{ro}", m.container_path));
        }
    }
    if failed {
        if let Some(err) = &run.output.error {
            lines.push(String::new());
            lines.push(format!("Error: {err}"));
        }
        lines.push(String::new());
        lines.push("=== Stderr (tail) ===".to_string());
        lines.push(run.stderr_tail.clone());
        lines.push(String::new());
        lines.push("=== Stdout (tail) ===".to_string());
        lines.push(run.stdout_tail.clone());
    }

    if let Err(e) = tokio::fs::create_dir_all(logs_dir).await {
        warn!(dir = %logs_dir.display(), err = %e, "failed to create logs dir");
        return;
    }
    match tokio::fs::write(&log_file, lines.join("\n")).await {
        Ok(()) => debug!(log_file = %log_file.display(), "worker log written"),
        Err(e) => warn!(log_file = %log_file.display(), err = %e, "failed to write worker log"),
    }
}

/// Graceful stop of a named container.
pub async fn stop_container(runtime_bin: &str, name: &str) -> bool {
    match Command::new(runtime_bin).args(["stop", name]).output().await {
        Ok(output) if output.status.success() => {
            info!(container = name, "container stopped");
            true
        }
        Ok(output) => {
            warn!(
                container = name,
                stderr = String::from_utf8_lossy(&output.stderr).trim(),
                "failed to stop container"
            );
            false
        }
        Err(e) => {
            warn!(container = name, err = %e, "failed to run container stop");
            false
        }
    }
}

pub async fn ensure_runtime_available(runtime_bin: &str) -> anyhow::Result<()> {
    let output = Command::new(runtime_bin)
        .arg("info")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("container runtime {runtime_bin:?} not found: {e}"))?;
    if !output.status.success() {
        anyhow::bail!("container runtime {runtime_bin:?} is not running");
    }
    debug!(runtime = runtime_bin, "container runtime available");
    Ok(())
}

/// Stop containers left behind by a previous run.
pub async fn cleanup_orphans(runtime_bin: &str) {
    let filter = format!("name={CONTAINER_NAME_PREFIX}");
    let output = match Command::new(runtime_bin)
        .args(["ps", "--filter", &filter, "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(err = %e, "failed to list orphaned containers");
            return;
        }
    };

    let listing = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|s| s.starts_with(CONTAINER_NAME_PREFIX))
        .collect();
    for name in &names {
        stop_container(runtime_bin, name).await;
    }
    if !names.is_empty() {
        info!(count = names.len(), names = ?names, "stopped orphaned containers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupvisor_core::{OUTPUT_END_MARKER, OUTPUT_START_MARKER};
    use std::sync::Mutex;
    use futures::FutureExt;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn input() -> WorkerInput {
        WorkerInput {
            prompt: "hello worker".to_string(),
            session_id: None,
            group_folder: "main".to_string(),
            chat_id: "chat-1".to_string(),
            is_main: true,
            is_scheduled_task: false,
        }
    }

    fn limits(timeout_ms: u64) -> RunLimits {
        RunLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: 4096,
            max_envelopes: 100,
            exit_grace: Duration::from_millis(300),
        }
    }

    fn envelope(result: &str) -> String {
        format!(
            "echo '{OUTPUT_START_MARKER}'; echo '{{\"status\":\"success\",\"result\":\"{result}\"}}'; echo '{OUTPUT_END_MARKER}';"
        )
    }

    fn collector() -> (OutputCallback, Arc<Mutex<Vec<WorkerOutput>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: OutputCallback = Arc::new(move |output| {
            sink.lock().unwrap().push(output);
            async {}.boxed()
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn streams_every_envelope_and_returns_the_last() {
        let script = format!(
            "echo booting; {} echo noise; {} echo done",
            envelope("first"),
            envelope("second")
        );
        let (callback, seen) = collector();
        let run = supervise(sh(&script), &input(), &limits(5000), None, Some(&callback)).await;

        assert_eq!(run.envelopes, 2);
        assert_eq!(run.output.result.as_deref(), Some("second"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].result.as_deref(), Some("first"));
        assert_eq!(run.exit_code, Some(0));
    }

    #[tokio::test]
    async fn input_arrives_as_one_json_line() {
        let script = format!(
            "read line; case \"$line\" in *'\"prompt\":\"hello worker\"'*) r=yes;; *) r=no;; esac; \
             echo '{OUTPUT_START_MARKER}'; echo \"{{\\\"status\\\":\\\"success\\\",\\\"result\\\":\\\"$r\\\"}}\"; echo '{OUTPUT_END_MARKER}'"
        );
        let run = supervise(sh(&script), &input(), &limits(5000), None, None).await;
        assert_eq!(run.output.result.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn no_envelope_is_an_error_with_exit_code() {
        let run = supervise(
            sh("echo just noise; echo broken >&2; exit 3"),
            &input(),
            &limits(5000),
            None,
            None,
        )
        .await;
        assert!(run.output.is_error());
        let err = run.output.error.unwrap();
        assert!(err.starts_with("No output received (exit code 3)"), "{err}");
        assert!(err.contains("broken"));
        assert!(run.stdout_tail.contains("just noise"));
    }

    #[tokio::test]
    async fn clean_exit_without_output_reports_no_output() {
        let run = supervise(sh("true"), &input(), &limits(5000), None, None).await;
        assert_eq!(run.output.error.as_deref(), Some("No output received"));
    }

    #[tokio::test]
    async fn malformed_and_oversized_blocks_are_skipped() {
        let big = "x".repeat(5000);
        let script = format!(
            "echo '{OUTPUT_START_MARKER}'; echo 'not json'; echo '{OUTPUT_END_MARKER}'; \
             echo '{OUTPUT_START_MARKER}'; echo '{big}'; echo '{OUTPUT_END_MARKER}'; {}",
            envelope("ok")
        );
        let run = supervise(sh(&script), &input(), &limits(5000), None, None).await;
        assert_eq!(run.envelopes, 1);
        assert_eq!(run.output.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn unterminated_flood_is_cut_at_the_cap() {
        let script = format!(
            "{} head -c 200000 /dev/zero | tr '\\0' x",
            envelope("ok")
        );
        let run = supervise(sh(&script), &input(), &limits(5000), None, None).await;
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.envelopes, 1);
        assert_eq!(run.output.result.as_deref(), Some("ok"));
        assert!(run.stdout_tail.len() <= LOG_TAIL_BYTES);
    }

    #[tokio::test]
    async fn overlong_line_inside_a_block_abandons_it() {
        let script = format!(
            "echo '{OUTPUT_START_MARKER}'; head -c 200000 /dev/zero | tr '\\0' x; echo; \
             echo '{OUTPUT_END_MARKER}'; {}",
            envelope("after")
        );
        let (callback, seen) = collector();
        let run = supervise(sh(&script), &input(), &limits(5000), None, Some(&callback)).await;
        assert_eq!(run.envelopes, 1);
        assert_eq!(run.output.result.as_deref(), Some("after"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn envelopes_past_the_cap_are_not_forwarded() {
        let script = format!("{} {} {}", envelope("one"), envelope("two"), envelope("three"));
        let mut capped = limits(5000);
        capped.max_envelopes = 2;
        let (callback, seen) = collector();
        let run = supervise(sh(&script), &input(), &capped, None, Some(&callback)).await;
        assert_eq!(run.envelopes, 3);
        assert_eq!(run.output.result.as_deref(), Some("three"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].result.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn capped_reader_drops_the_rest_of_a_long_line() {
        let data: &[u8] = b"short\nabcdefghij\ntail";
        let mut reader = BufReader::with_capacity(3, data);
        let mut buf = Vec::new();

        assert_eq!(read_line_capped(&mut reader, &mut buf, 6).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"short\n");

        buf.clear();
        assert_eq!(
            read_line_capped(&mut reader, &mut buf, 6).await.unwrap(),
            LineRead::Overlong(11)
        );
        assert_eq!(buf, b"abcdef");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 6).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"tail");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 6).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let started = Instant::now();
        let run = supervise(sh("sleep 10"), &input(), &limits(200), None, None).await;
        assert!(run.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            run.output.error.as_deref(),
            Some("Worker timed out after 200ms")
        );
    }

    #[tokio::test]
    async fn lingering_process_killed_after_output_closes() {
        let script = format!("{} exec >&-; sleep 10", envelope("done"));
        let started = Instant::now();
        let run = supervise(sh(&script), &input(), &limits(5000), None, None).await;
        assert!(!run.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(run.output.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_envelope() {
        let run = supervise(
            Command::new("/nonexistent/worker-binary"),
            &input(),
            &limits(1000),
            None,
            None,
        )
        .await;
        assert!(run.output.error.unwrap().starts_with("Failed to spawn worker"));
    }

    #[test]
    fn tail_keeps_last_bytes_on_char_boundary() {
        let mut tail = Tail::new(4);
        tail.push("abcdé");
        assert!(tail.buf.len() <= 5);
        assert!(tail.buf.ends_with('é'));
        assert_eq!(last_chars("hello world\n", 5), "world");
        assert_eq!(last_chars("hi", 5), "hi");
    }
}
