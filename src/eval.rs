use std::error;
use std::ffi::{CString, NulError, OsStr};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::process;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::builtin;
use crate::types::{Outcome, Pipeline, Stage, Status};

#[derive(Debug)]
pub enum ExecError {
	Nix(nix::Error),
	Io(io::Error),
	Nul(NulError),
}

impl From<nix::Error> for ExecError {
	fn from(e: nix::Error) -> ExecError {
		ExecError::Nix(e)
	}
}
impl From<io::Error> for ExecError {
	fn from(e: io::Error) -> ExecError {
		ExecError::Io(e)
	}
}
impl From<NulError> for ExecError {
	fn from(e: NulError) -> ExecError {
		ExecError::Nul(e)
	}
}

impl fmt::Display for ExecError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ExecError::Nix(ref e) => write!(f, "{}", e),
			ExecError::Io(ref e) => write!(f, "{}", e),
			ExecError::Nul(ref e) => write!(f, "{}", e),
		}
	}
}

impl error::Error for ExecError {
	fn source(&self) -> Option<&(dyn error::Error + 'static)> {
		match *self {
			ExecError::Nix(ref e) => Some(e),
			ExecError::Io(ref e) => Some(e),
			ExecError::Nul(ref e) => Some(e),
		}
	}
}

fn report(what: &str, err: &dyn fmt::Display) {
	let _ = writeln!(io::stderr(), "psh: {}: {}", what, err);
}

/// Descriptors the orchestrator assigned to a stage. `None` means the
/// stage sits at a pipeline boundary and keeps the real stdin/stdout.
/// The orchestrator retains ownership of the underlying pipe endpoints;
/// the child duplicates them onto fds 0/1 before exec.
#[derive(Default)]
struct Wiring<'a> {
	stdin: Option<BorrowedFd<'a>>,
	stdout: Option<BorrowedFd<'a>>,
}

/// Wires a stage's effective input/output onto the process's standard
/// descriptors. A file redirection takes precedence over a pipe-supplied
/// descriptor. Runs post-fork in children, and in the interpreter itself
/// on the built-in path.
fn apply_redirections(stage: &Stage, wiring: &Wiring) -> Result<(), ExecError> {
	if let Some(ref path) = stage.in_file {
		let file = fs::OpenOptions::new()
			.read(true)
			.open(OsStr::from_bytes(path))?;
		let fd = file.into_raw_fd();
		unistd::dup2(fd, libc::STDIN_FILENO)?;
		unistd::close(fd)?;
	} else if let Some(ref fd) = wiring.stdin {
		unistd::dup2(fd.as_raw_fd(), libc::STDIN_FILENO)?;
	}

	if let Some(ref path) = stage.out_file {
		let file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o644)
			.open(OsStr::from_bytes(path))?;
		let fd = file.into_raw_fd();
		unistd::dup2(fd, libc::STDOUT_FILENO)?;
		unistd::close(fd)?;
	} else if let Some(ref fd) = wiring.stdout {
		unistd::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO)?;
	}

	Ok(())
}

/// Post-fork path of a child stage: redirect, then replace the image via
/// the PATH search. Failures past the fork cannot propagate to the parent
/// as values; the child reports and exits with a shell-conventional code.
fn exec_child(stage: &Stage, argv: &[CString], wiring: &Wiring) -> ! {
	// The Rust runtime ignores SIGPIPE and the disposition survives exec;
	// restore the default so a stage whose reader exits early terminates
	// normally instead of hitting write errors.
	let _ = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) };
	let err = match apply_redirections(stage, wiring) {
		Ok(()) => match unistd::execvp(&argv[0], argv) {
			Ok(never) => match never {},
			Err(e) => ExecError::Nix(e),
		},
		Err(e) => e,
	};
	let _ = writeln!(io::stderr(), "psh: {}: {}",
		String::from_utf8_lossy(stage.program()), err);
	let code = match err {
		ExecError::Nix(Errno::ENOENT) => 127,
		ExecError::Nix(_) => 126,
		_ => 1,
	};
	unsafe { libc::_exit(code) }
}

fn spawn_stage(stage: &Stage, wiring: &Wiring) -> Result<Pid, ExecError> {
	// argv is built before the fork so the child allocates as little as
	// possible between fork and exec.
	let argv = stage.argv.iter()
		.map(|arg| CString::new(arg.as_slice()))
		.collect::<Result<Vec<CString>, NulError>>()?;
	let fork = unsafe { unistd::fork() };
	match fork? {
		ForkResult::Parent { child } => Ok(child),
		ForkResult::Child => exec_child(stage, &argv, wiring),
	}
}

/// Runs a lone external stage: fork, exec, wait for that child. Only the
/// fork/wait mechanics decide the status; the child's own exit code is
/// not inspected on this path.
pub fn spawn(stage: &Stage) -> Status {
	let pid = match spawn_stage(stage, &Wiring::default()) {
		Ok(pid) => pid,
		Err(e) => {
			report("spawn", &e);
			return Status::Fail;
		},
	};
	match waitpid(pid, None) {
		Ok(_) => Status::Success,
		Err(e) => {
			report("waitpid", &e);
			Status::Fail
		},
	}
}

/// Spawns every stage left-to-right with pipe junctions between adjacent
/// stages, then waits for each child exactly once. Children run
/// concurrently; the pipes' own backpressure sequences them. Both ends of
/// a junction are owned values, so every endpoint this process keeps is
/// closed on every exit path, including the fail-fast breaks.
fn run_piped(pipeline: &Pipeline) -> Status {
	let last = pipeline.stages.len() - 1;
	let mut pids: Vec<Pid> = Vec::with_capacity(pipeline.stages.len());
	let mut prev_read: Option<OwnedFd> = None;
	let mut status = Status::Success;

	for (i, stage) in pipeline.stages.iter().enumerate() {
		let junction = if i < last {
			match unistd::pipe2(OFlag::O_CLOEXEC) {
				Ok(ends) => Some(ends),
				Err(e) => {
					report("pipe", &e);
					status = Status::Fail;
					break;
				},
			}
		} else {
			None
		};

		let wiring = Wiring {
			stdin: prev_read.as_ref().map(|fd| fd.as_fd()),
			stdout: junction.as_ref().map(|(_, write_end)| write_end.as_fd()),
		};
		match spawn_stage(stage, &wiring) {
			Ok(pid) => pids.push(pid),
			Err(e) => {
				report("spawn", &e);
				status = Status::Fail;
				break;
			},
		}

		// The write end drops here; the read end the previous child was
		// draining is replaced (and thereby closed) in the same move.
		prev_read = junction.map(|(read_end, _)| read_end);
	}
	drop(prev_read);

	for pid in pids {
		match waitpid(pid, None) {
			Ok(WaitStatus::Exited(_, 0)) => {},
			// Death by SIGPIPE means the stage's reader finished early,
			// which is ordinary pipeline operation, not a failure.
			Ok(WaitStatus::Signaled(_, Signal::SIGPIPE, _)) => {},
			Ok(_) => { status = Status::Fail; },
			Err(e) => {
				report("waitpid", &e);
				status = Status::Fail;
			},
		}
	}
	status
}

/// The one-stage case. Built-ins run in this process with fds 0/1
/// temporarily rewired; each descriptor is restored only if the stage
/// actually requested that redirection. External programs go through the
/// spawner with no pipe plumbing.
fn run_single(stage: &Stage) -> Outcome {
	let func = match builtin::lookup(stage.program()) {
		Some(func) => func,
		None => return Outcome::Continue(spawn(stage)),
	};

	let saved = match save_stdio() {
		Ok(saved) => saved,
		Err(e) => {
			report("dup", &e);
			return Outcome::Continue(Status::Fail);
		},
	};
	let _ = io::stdout().flush();
	if let Err(e) = apply_redirections(stage, &Wiring::default()) {
		let _ = writeln!(io::stderr(), "psh: {}: {}",
			String::from_utf8_lossy(stage.program()), e);
		process::exit(1);
	}

	let outcome = func(&stage.argv[1..]);

	let _ = io::stdout().flush();
	if stage.in_file.is_some() {
		if let Err(e) = unistd::dup2(saved.0.as_raw_fd(), libc::STDIN_FILENO) {
			report("dup2", &e);
		}
	}
	if stage.out_file.is_some() {
		if let Err(e) = unistd::dup2(saved.1.as_raw_fd(), libc::STDOUT_FILENO) {
			report("dup2", &e);
		}
	}
	outcome
}

fn save_stdio() -> io::Result<(OwnedFd, OwnedFd)> {
	let stdin = io::stdin().as_fd().try_clone_to_owned()?;
	let stdout = io::stdout().as_fd().try_clone_to_owned()?;
	Ok((stdin, stdout))
}

/// Sole entry point for the session loop.
pub fn run_pipeline(pipeline: &Pipeline) -> Outcome {
	assert!(!pipeline.stages.is_empty());
	if let [ref stage] = pipeline.stages[..] {
		run_single(stage)
	} else {
		Outcome::Continue(run_piped(pipeline))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	fn stage(argv: &[&str]) -> Stage {
		Stage {
			argv: argv.iter().map(|a| a.as_bytes().to_vec()).collect(),
			in_file: None,
			out_file: None,
		}
	}

	fn pipeline(stages: Vec<Stage>) -> Pipeline {
		Pipeline { stages: stages }
	}

	#[test]
	fn one_stage_needs_no_junction() {
		let p = pipeline(vec![stage(&["true"])]);
		assert_eq!(p.junctions(), 0);
		assert_eq!(run_piped(&p), Status::Success);
	}

	#[test]
	fn failing_exit_code_reduces_to_fail() {
		let p = pipeline(vec![stage(&["false"])]);
		assert_eq!(run_piped(&p), Status::Fail);
	}

	#[test]
	fn spawn_checks_mechanics_not_exit_code() {
		assert_eq!(spawn(&stage(&["false"])), Status::Success);
	}

	#[test]
	fn three_stages_sort_and_count() {
		let dir = tempdir().unwrap();
		let out = dir.path().join("out");

		let mut tail = stage(&["uniq", "-c"]);
		tail.out_file = Some(out.as_os_str().as_encoded_bytes().to_vec());
		let p = pipeline(vec![
			stage(&["printf", "a\nb\na\n"]),
			stage(&["sort"]),
			tail,
		]);
		assert_eq!(p.junctions(), 2);
		assert_eq!(run_piped(&p), Status::Success);

		let text = fs::read_to_string(&out).unwrap();
		let counts: Vec<&str> = text.split_whitespace().collect();
		assert_eq!(counts, ["2", "a", "1", "b"]);
	}

	#[test]
	fn transfer_larger_than_a_pipe_buffer() {
		let dir = tempdir().unwrap();
		let out = dir.path().join("out");

		let mut tail = stage(&["wc", "-l"]);
		tail.out_file = Some(out.as_os_str().as_encoded_bytes().to_vec());
		let p = pipeline(vec![stage(&["seq", "1", "50000"]), tail]);
		assert_eq!(run_piped(&p), Status::Success);

		let text = fs::read_to_string(&out).unwrap();
		assert_eq!(text.trim(), "50000");
	}

	#[test]
	fn sigpipe_upstream_does_not_fail_the_pipeline() {
		let dir = tempdir().unwrap();
		let out = dir.path().join("out");

		let mut tail = stage(&["head", "-1"]);
		tail.out_file = Some(out.as_os_str().as_encoded_bytes().to_vec());
		let p = pipeline(vec![stage(&["seq", "1", "1000000"]), tail]);
		assert_eq!(run_piped(&p), Status::Success);

		let text = fs::read_to_string(&out).unwrap();
		assert_eq!(text.trim(), "1");
	}

	#[test]
	fn missing_program_fails_without_hanging_siblings() {
		let p = pipeline(vec![
			stage(&["printf", "x"]),
			stage(&["psh-no-such-program-1a2b3c"]),
		]);
		assert_eq!(run_piped(&p), Status::Fail);
	}

	#[test]
	fn input_redirection_feeds_a_lone_stage() {
		let dir = tempdir().unwrap();
		let input = dir.path().join("in");
		let out = dir.path().join("out");
		fs::write(&input, "one\ntwo\nthree\n").unwrap();

		let mut s = stage(&["wc", "-l"]);
		s.in_file = Some(input.as_os_str().as_encoded_bytes().to_vec());
		s.out_file = Some(out.as_os_str().as_encoded_bytes().to_vec());
		let p = pipeline(vec![s]);
		assert_eq!(run_piped(&p), Status::Success);

		let text = fs::read_to_string(&out).unwrap();
		assert_eq!(text.trim(), "3");
	}

	#[test]
	fn file_redirection_overrides_a_pipe() {
		let dir = tempdir().unwrap();
		let input = dir.path().join("in");
		let out = dir.path().join("out");
		fs::write(&input, "from-file\n").unwrap();

		let mut tail = stage(&["cat"]);
		tail.in_file = Some(input.as_os_str().as_encoded_bytes().to_vec());
		tail.out_file = Some(out.as_os_str().as_encoded_bytes().to_vec());
		let p = pipeline(vec![stage(&["printf", "from-pipe\n"]), tail]);
		assert_eq!(run_piped(&p), Status::Success);

		let text = fs::read_to_string(&out).unwrap();
		assert_eq!(text, "from-file\n");
	}

	#[test]
	fn exit_builtin_terminates_through_the_dispatcher() {
		let p = pipeline(vec![stage(&["exit"])]);
		assert_eq!(run_pipeline(&p), Outcome::Terminate);
	}

	#[test]
	fn unknown_single_command_goes_to_the_spawner() {
		let p = pipeline(vec![stage(&["true"])]);
		assert_eq!(run_pipeline(&p), Outcome::Continue(Status::Success));
	}

	#[test]
	fn nul_byte_in_argv_fails_before_forking() {
		let s = Stage {
			argv: vec![b"tr\0uncate".to_vec()],
			in_file: None,
			out_file: None,
		};
		assert_eq!(spawn(&s), Status::Fail);
	}
}
