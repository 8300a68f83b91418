#![forbid(unsafe_code)]

/// Pure predicate over message text. A match means the message is dropped.
pub trait ContentFilter: Send + Sync {
	fn matches(&self, text: &str) -> bool;
}

/// Case-insensitive substring filter over a configured term list.
#[derive(Debug, Clone, Default)]
pub struct TermFilter {
	terms: Vec<String>,
}

impl TermFilter {
	pub fn new<I, S>(terms: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let terms = terms
			.into_iter()
			.map(|t| t.as_ref().trim().to_lowercase())
			.filter(|t| !t.is_empty())
			.collect();
		Self { terms }
	}

	pub fn is_empty(&self) -> bool {
		self.terms.is_empty()
	}

	pub fn len(&self) -> usize {
		self.terms.len()
	}
}

impl ContentFilter for TermFilter {
	fn matches(&self, text: &str) -> bool {
		if self.terms.is_empty() || text.is_empty() {
			return false;
		}
		let text = text.to_lowercase();
		self.terms.iter().any(|t| text.contains(t.as_str()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_filter_matches_nothing() {
		let f = TermFilter::new(Vec::<String>::new());
		assert!(!f.matches("anything"));
		assert!(!f.matches(""));
	}

	#[test]
	fn matches_case_insensitive_substrings() {
		let f = TermFilter::new(["BadWord", "  spam  "]);
		assert!(f.matches("this has a badword inside"));
		assert!(f.matches("SPAM!"));
		assert!(!f.matches("perfectly fine"));
	}

	#[test]
	fn blank_terms_are_ignored() {
		let f = TermFilter::new(["", "   "]);
		assert!(f.is_empty());
		assert!(!f.matches("x"));
	}
}
