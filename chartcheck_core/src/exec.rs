use std::future::Future;
use std::pin::Pin;

use tokio::process::Command;

use crate::Result;

/// Captured stdout+stderr and exit status of one external tool invocation.
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ExecOutput {
    /// stdout and stderr concatenated, as spec.md §4.1 ("capture combined
    /// stdout+stderr") requires for render failures.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// The external tools (template engine, schema validator, registry client)
/// are black boxes invoked by name with argument lists - spec.md §1 treats
/// this as an out-of-scope collaborator with a minimal interface. This trait
/// is that interface; `ProcessExecutor` is the real implementation,
/// `FakeExecutor` (test-only) scripts deterministic responses.
pub trait CommandExecutor: Send + Sync {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutput>> + Send + 'a>>;
}

/// Shells out via `tokio::process::Command`, matching the teacher's
/// `kubectl.rs` `kout`/`kexec` pair generalized to an arbitrary program.
pub struct ProcessExecutor;

impl CommandExecutor for ProcessExecutor {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutput>> + Send + 'a>> {
        Box::pin(async move {
            debug!("{} {}", program, args.join(" "));
            let out = Command::new(program).kill_on_drop(true).args(args).output().await?;
            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                success: out.status.success(),
            })
        })
    }
}

/// Checks whether a file exists, the explicit pre-render check spec.md
/// §4.1 calls for ("the tool's own error for a missing file is opaque").
pub fn file_exists(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// One scripted response for a `(program, joined args)` invocation.
    #[derive(Clone, Debug)]
    pub struct Scripted {
        pub output: ExecOutput,
    }

    /// Deterministic stand-in for the real tools, keyed by `program` name.
    /// Each program has a queue of responses consumed in call order, so a
    /// test can script "first call succeeds, second call fails" without
    /// depending on which image/chart triggered which call.
    #[derive(Default)]
    pub struct FakeExecutor {
        responses: Mutex<HashMap<String, Vec<Scripted>>>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, program: &str, success: bool, stdout: &str, stderr: &str) {
            self.responses
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_insert_with(Vec::new)
                .push(Scripted {
                    output: ExecOutput {
                        stdout: stdout.to_string(),
                        stderr: stderr.to_string(),
                        success,
                    },
                });
        }

        pub fn call_count(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == program)
                .count()
        }
    }

    impl CommandExecutor for FakeExecutor {
        fn run<'a>(
            &'a self,
            program: &'a str,
            args: &'a [String],
        ) -> Pin<Box<dyn Future<Output = Result<ExecOutput>> + Send + 'a>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((program.to_string(), args.to_vec()));
                let mut responses = self.responses.lock().unwrap();
                let queue = responses.entry(program.to_string()).or_insert_with(Vec::new);
                if queue.is_empty() {
                    bail!("FakeExecutor: no scripted response left for {}", program);
                }
                Ok(queue.remove(0).output)
            })
        }
    }
}
