//! Parsed form of a contraction pattern.

/// Keys of each input operand and of the output.
///
/// `"ij,j->i"` parses to inputs `[['i','j'], ['j']]` and output `['i']`.
/// Without `->` the output is empty, meaning full reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractionPattern {
    pub inputs: Vec<Vec<char>>,
    pub output: Vec<char>,
}

impl ContractionPattern {
    /// Number of input operands.
    pub fn arity(&self) -> usize {
        self.inputs.len()
    }
}

impl std::fmt::Display for ContractionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(|keys| keys.iter().collect()).collect();
        let output: String = self.output.iter().collect();
        write!(f, "{}->{}", inputs.join(","), output)
    }
}
