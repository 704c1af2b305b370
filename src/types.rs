#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status { Success, Fail }

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
	Continue(Status),
	Terminate,
}

/// One pipeline segment. `argv` is never empty; `argv[0]` is the program
/// name, also used for built-in lookup. Paths and arguments stay raw bytes
/// so non-UTF-8 input survives up to the exec boundary.
#[derive(Debug, PartialEq, Eq)]
pub struct Stage {
	pub argv: Vec<Vec<u8>>,
	pub in_file: Option<Vec<u8>>,
	pub out_file: Option<Vec<u8>>,
}

impl Stage {
	pub fn program(&self) -> &[u8] {
		&self.argv[0]
	}
}

/// A non-empty sequence of stages; adjacent stages share one pipe junction.
#[derive(Debug, PartialEq, Eq)]
pub struct Pipeline {
	pub stages: Vec<Stage>,
}

impl Pipeline {
	pub fn junctions(&self) -> usize {
		self.stages.len() - 1
	}
}
