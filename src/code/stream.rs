use std::fmt;

/// One not-yet-assembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operands: String,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            f.write_str(&self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Ordered staging list of instructions for one architecture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionStream {
    architecture: String,
    instructions: Vec<Instruction>,
}

impl InstructionStream {
    pub fn new(architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            instructions: Vec::new(),
        }
    }

    /// Build a stream from assembly-like text.
    ///
    /// One instruction per line. Text after `;` or `#` is a comment, blank
    /// lines are skipped, and the first run of whitespace separates the
    /// mnemonic from its operands.
    pub fn parse(architecture: impl Into<String>, text: &str) -> Self {
        let mut stream = Self::new(architecture);
        for line in text.lines() {
            let code = line.split([';', '#']).next().unwrap_or("").trim();
            if code.is_empty() {
                continue;
            }
            match code.split_once(char::is_whitespace) {
                Some((mnemonic, operands)) => stream.push(mnemonic, operands.trim()),
                None => stream.push(code, ""),
            }
        }
        stream
    }

    pub fn push(&mut self, mnemonic: impl Into<String>, operands: impl Into<String>) {
        self.instructions.push(Instruction {
            mnemonic: mnemonic.into(),
            operands: operands.into(),
        });
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn clear(&mut self) {
        self.instructions.clear();
    }
}

impl<'a> IntoIterator for &'a InstructionStream {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
