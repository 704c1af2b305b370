mod builtin;
mod eval;
mod parser;
mod types;

use std::io;
use std::io::{BufRead, Write};

use clap::Parser;

use crate::types::{Outcome, Status};

const PROMPT: &[u8] = b">>> $ ";

#[derive(Parser)]
#[command(name = "psh", version, about = "An interactive shell with pipelines and file redirections")]
struct Cli {
	/// Execute a single command line and exit instead of starting the
	/// interactive loop.
	#[arg(short = 'c', value_name = "LINE")]
	command: Option<String>,
}

struct Session {
	running: bool,
}

impl Session {
	fn new() -> Session {
		Session { running: true }
	}

	fn run_line(&mut self, line: &[u8]) -> Status {
		if line.iter().all(|&c| c == b' ' || c == b'\t' || c == b'\n') {
			return Status::Success;
		}
		let pipeline = match parser::parse(line) {
			Ok(pipeline) => pipeline,
			Err(e) => {
				let _ = writeln!(io::stderr(), "psh: {}", e);
				return Status::Fail;
			},
		};
		match eval::run_pipeline(&pipeline) {
			Outcome::Continue(status) => status,
			Outcome::Terminate => {
				self.running = false;
				Status::Success
			},
		}
	}

	fn repl(&mut self) -> i32 {
		let mut stdout = io::stdout();
		let stdin = io::stdin();
		let mut stdin = stdin.lock();
		while self.running {
			let _ = stdout.write(PROMPT);
			let _ = stdout.flush();
			let mut line: Vec<u8> = vec![];
			match stdin.read_until(b'\n', &mut line) {
				Ok(0) => break,
				Ok(_) => {
					self.run_line(&line);
				},
				Err(e) => {
					let _ = writeln!(io::stderr(), "psh: read: {}", e);
					break;
				},
			}
		}
		0
	}
}

fn main() {
	let cli = Cli::parse();
	let mut session = Session::new();
	let code = match cli.command {
		Some(line) => match session.run_line(line.as_bytes()) {
			Status::Success => 0,
			Status::Fail => 1,
		},
		None => session.repl(),
	};
	std::process::exit(code);
}
