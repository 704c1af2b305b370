use crate::types::{Pipeline, Stage};

pub type ParseResult<T> = Result<T, String>;

struct Scanner<'a> {
	line: &'a [u8],
	i: usize,
}

impl<'a> Scanner<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		match c {
			b' ' | b'\t' | b'\n' => true,
			_ => false,
		}
	}

	fn is_word(c: u8) -> bool {
		match c {
			b'>' | b'<' | b'&' | b'|' => false,
			_ => !Scanner::is_whitespace(c),
		}
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Scanner::is_whitespace);
	}

	fn read_word(&mut self) -> &'a [u8] {
		let orig = self.i;
		self.proceed_while(Scanner::is_word);
		&self.line[orig .. self.i]
	}

	fn read_redirect_target(&mut self) -> ParseResult<Vec<u8>> {
		self.skip_whitespaces();
		let target = self.read_word();
		if target.is_empty() {
			return Err("missing redirect target".to_string());
		}
		Ok(target.to_vec())
	}

	fn parse_stage(&mut self) -> ParseResult<Stage> {
		let mut argv: Vec<Vec<u8>> = vec![];
		let mut in_file: Option<Vec<u8>> = None;
		let mut out_file: Option<Vec<u8>> = None;

		loop {
			self.skip_whitespaces();
			match self.line.get(self.i) {
				Some(&b'<') => {
					self.i += 1;
					in_file = Some(self.read_redirect_target()?);
				},
				Some(&b'>') => {
					if self.line.get(self.i + 1) == Some(&b'>') {
						return Err("appending redirect '>>' is not supported".to_string());
					}
					self.i += 1;
					out_file = Some(self.read_redirect_target()?);
				},
				_ => {
					let word = self.read_word();
					if word.is_empty() { break; }
					argv.push(word.to_vec());
				},
			}
		}

		if argv.is_empty() {
			return Err("empty command".to_string());
		}
		Ok(Stage { argv: argv, in_file: in_file, out_file: out_file })
	}

	fn parse_pipeline(&mut self) -> ParseResult<Pipeline> {
		let mut stages: Vec<Stage> = vec![];

		loop {
			stages.push(self.parse_stage()?);
			match self.line.get(self.i) {
				Some(&b'|') => { self.i += 1; },
				Some(&b'&') => {
					return Err("background jobs are not supported".to_string());
				},
				Some(&c) => {
					return Err(format!("unexpected character: '{}'", c as char));
				},
				None => { break; },
			}
		}
		Ok(Pipeline { stages: stages })
	}
}

pub fn parse(line: &[u8]) -> ParseResult<Pipeline> {
	let mut scanner = Scanner { line: line, i: 0 };
	scanner.parse_pipeline()
}
