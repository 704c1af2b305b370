use std::env;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::types::{Outcome, Status};

/// Built-ins run in the interpreter's own process so they can mutate
/// interpreter state (working directory, termination). They take the
/// stage's arguments without the program name. Output goes through the
/// live stdout, which the dispatcher may have redirected, and is flushed
/// before the descriptors are swapped back.
pub type Builtin = fn(&[Vec<u8>]) -> Outcome;

pub fn lookup(name: &[u8]) -> Option<Builtin> {
	match name {
		b"cd" => Some(builtin_cd),
		b"pwd" => Some(builtin_pwd),
		b"echo" => Some(builtin_echo),
		b"exit" => Some(builtin_exit),
		_ => None,
	}
}

fn builtin_cd(args: &[Vec<u8>]) -> Outcome {
	let target = match args.first() {
		Some(arg) => PathBuf::from(OsStr::from_bytes(arg)),
		None => match env::var_os("HOME") {
			Some(home) => PathBuf::from(home),
			None => {
				let _ = writeln!(io::stderr(), "psh: cd: HOME is not set");
				return Outcome::Continue(Status::Fail);
			},
		},
	};
	match env::set_current_dir(&target) {
		Ok(()) => Outcome::Continue(Status::Success),
		Err(e) => {
			let _ = writeln!(io::stderr(), "psh: cd: {}: {}", target.display(), e);
			Outcome::Continue(Status::Fail)
		},
	}
}

fn builtin_pwd(_: &[Vec<u8>]) -> Outcome {
	let dir = match env::current_dir() {
		Ok(dir) => dir,
		Err(e) => {
			let _ = writeln!(io::stderr(), "psh: pwd: {}", e);
			return Outcome::Continue(Status::Fail);
		},
	};
	let mut stdout = io::stdout();
	let r = stdout.write_all(dir.as_os_str().as_bytes())
		.and_then(|_| stdout.write_all(b"\n"))
		.and_then(|_| stdout.flush());
	match r {
		Ok(()) => Outcome::Continue(Status::Success),
		Err(e) => {
			let _ = writeln!(io::stderr(), "psh: pwd: {}", e);
			Outcome::Continue(Status::Fail)
		},
	}
}

fn builtin_echo(args: &[Vec<u8>]) -> Outcome {
	let mut stdout = io::stdout();
	let mut write_args = || -> io::Result<()> {
		for (i, arg) in args.iter().enumerate() {
			if i > 0 {
				stdout.write_all(b" ")?;
			}
			stdout.write_all(arg)?;
		}
		stdout.write_all(b"\n")?;
		stdout.flush()
	};
	match write_args() {
		Ok(()) => Outcome::Continue(Status::Success),
		Err(e) => {
			let _ = writeln!(io::stderr(), "psh: echo: {}", e);
			Outcome::Continue(Status::Fail)
		},
	}
}

fn builtin_exit(_: &[Vec<u8>]) -> Outcome {
	Outcome::Terminate
}
