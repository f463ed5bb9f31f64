use std::io::{Read, Write};

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize, SlavePty,
};

use crate::transport::{ChildProcess, CommandSpec, PseudoConsole, TermSize, Transport, TransportError};

/// The OS pseudo-console transport (ConPTY on Windows, a Unix PTY elsewhere).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTransport;

impl NativeTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for NativeTransport {
    fn open(&self, size: TermSize) -> Result<Box<dyn PseudoConsole>, TransportError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| TransportError::OpenFailed(format!("failed to open PTY: {e}")))?;

        Ok(Box::new(NativeConsole {
            master: pair.master,
            slave: Some(pair.slave),
        }))
    }
}

/// Owns the portable-pty master and, until a child is spawned, the slave side.
struct NativeConsole {
    master: Box<dyn MasterPty + Send>,
    slave: Option<Box<dyn SlavePty + Send>>,
}

impl PseudoConsole for NativeConsole {
    fn spawn(&mut self, command: &CommandSpec) -> Result<Box<dyn ChildProcess>, TransportError> {
        let slave = self
            .slave
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("console already has a child".into()))?;

        let child = slave
            .spawn_command(command_builder(command))
            .map_err(|e| {
                TransportError::SpawnFailed(format!("failed to spawn {}: {e}", command.program))
            })?;

        // The child holds its own copy of the slave side; ours must go so the
        // reader sees end-of-stream once the child exits.
        drop(slave);

        log::debug!(
            "spawned {} (pid {:?}) on native PTY",
            command.program,
            child.process_id()
        );

        Ok(Box::new(NativeChild { child }))
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, TransportError> {
        self.master
            .try_clone_reader()
            .map_err(|e| TransportError::OpenFailed(format!("failed to clone reader: {e}")))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, TransportError> {
        self.master
            .take_writer()
            .map_err(|e| TransportError::OpenFailed(format!("failed to take writer: {e}")))
    }

    fn resize(&mut self, size: TermSize) -> Result<(), TransportError> {
        self.master
            .resize(size.into())
            .map_err(|e| TransportError::ResizeFailed(format!("{e}")))
    }

    fn size(&self) -> Result<TermSize, TransportError> {
        self.master
            .get_size()
            .map(TermSize::from)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }
}

struct NativeChild {
    child: Box<dyn Child + Send + Sync>,
}

impl ChildProcess for NativeChild {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for TermSize {
    fn from(size: PtySize) -> Self {
        TermSize::new(size.cols, size.rows)
    }
}

fn command_builder(spec: &CommandSpec) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }
    if let Some(env) = &spec.env {
        cmd.env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }
    }
    cmd
}

/// Returns the user's default shell.
///
/// - Unix: `$SHELL`, falling back to `/bin/sh`
/// - Windows: `%COMSPEC%`, falling back to `cmd.exe`
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn_sh(args: &[&str]) -> (Box<dyn PseudoConsole>, Box<dyn ChildProcess>) {
        let mut console = NativeTransport::new()
            .open(TermSize::new(80, 24))
            .expect("open PTY");
        let mut spec = CommandSpec::new("/bin/sh");
        spec.args = args.iter().map(|a| a.to_string()).collect();
        let child = console.spawn(&spec).expect("spawn /bin/sh");
        (console, child)
    }

    /// Drain the reader on a background thread until EOF or the deadline.
    fn collect_output(mut reader: Box<dyn Read + Send>, needle: &'static str) -> String {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(chunk) => {
                    output.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    fn wait_exit(child: &mut Box<dyn ChildProcess>) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(Some(code)) = child.try_wait() {
                return Some(code);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }

    #[test]
    fn test_spawn_pty() {
        let (_console, mut child) = spawn_sh(&[]);
        assert!(child.pid().is_some());
        assert_eq!(child.try_wait().unwrap(), None);
        child.kill().unwrap();
    }

    #[test]
    fn test_write_read_echo() {
        let (mut console, mut child) = spawn_sh(&[]);
        let reader = console.take_reader().unwrap();
        let mut writer = console.take_writer().unwrap();

        writer.write_all(b"echo TETHER_TEST_OK\n").unwrap();
        writer.flush().unwrap();

        let text = collect_output(reader, "TETHER_TEST_OK");
        assert!(
            text.contains("TETHER_TEST_OK"),
            "Expected output to contain TETHER_TEST_OK, got: {text}"
        );
        child.kill().unwrap();
    }

    #[test]
    fn test_resize() {
        let (mut console, mut child) = spawn_sh(&[]);
        console.resize(TermSize::new(120, 40)).unwrap();
        assert_eq!(console.size().unwrap(), TermSize::new(120, 40));
        child.kill().unwrap();
    }

    #[test]
    fn test_child_exit_code() {
        let (_console, mut child) = spawn_sh(&["-c", "exit 3"]);
        assert_eq!(wait_exit(&mut child), Some(3));
    }

    #[test]
    fn test_env_replaces_parent_environment() {
        let mut console = NativeTransport::new().open(TermSize::default()).unwrap();
        let reader = console.take_reader().unwrap();
        let mut spec = CommandSpec::new("/bin/sh");
        spec.args = vec!["-c".into(), "echo VALUE=$TETHER_VAR".into()];
        let mut env = std::collections::BTreeMap::new();
        env.insert("TETHER_VAR".to_string(), "tethered".to_string());
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        spec.env = Some(env);

        let _child = console.spawn(&spec).unwrap();
        let text = collect_output(reader, "VALUE=tethered");
        assert!(text.contains("VALUE=tethered"), "got: {text}");
    }

    #[test]
    fn test_spawn_twice_fails() {
        let (mut console, mut child) = spawn_sh(&[]);
        let second = console.spawn(&CommandSpec::new("/bin/sh"));
        assert!(matches!(second, Err(TransportError::SpawnFailed(_))));
        child.kill().unwrap();
    }

    #[test]
    fn test_missing_program_fails() {
        let mut console = NativeTransport::new().open(TermSize::default()).unwrap();
        let result = console.spawn(&CommandSpec::new("/nonexistent/tether_missing_cmd"));
        assert!(matches!(result, Err(TransportError::SpawnFailed(_))));
    }

    #[test]
    fn test_default_shell_detection() {
        let shell = default_shell();
        assert!(!shell.is_empty(), "Default shell should not be empty");
    }
}
