/// IP allow-list consulted before an accepted peer is registered.
///
/// Entries are literal addresses (`192.168.1.20`, `::1`) or prefixes
/// ending in `.`, `:` or `*` (`192.168.1.`, `fe80:`, `10.*`). An empty
/// list or a `*` entry allows everyone. UNIX peers are never checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptPolicy {
	allow: Vec<String>,
}

impl AcceptPolicy {
	pub fn new<I, S>(entries: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let allow = entries
			.into_iter()
			.map(Into::into)
			.map(|entry: String| entry.trim().to_owned())
			.filter(|entry| !entry.is_empty())
			.collect();
		Self { allow }
	}

	pub fn allow_all() -> Self {
		Self::default()
	}

	/// Parses a comma or whitespace separated list, as stored in configuration.
	pub fn parse(list: &str) -> Self {
		Self::new(list.split(|c: char| c == ',' || c.is_whitespace()))
	}

	pub fn entries(&self) -> &[String] {
		&self.allow
	}

	pub fn allows_everyone(&self) -> bool {
		self.allow.is_empty() || self.allow.iter().any(|entry| entry == "*")
	}

	/// Decides whether `remote` (an address string without port) may connect.
	pub fn allows(&self, remote: &str) -> bool {
		if self.allows_everyone() {
			return true;
		}
		self.allow.iter().any(|entry| {
			if let Some(prefix) = entry.strip_suffix('*') {
				remote.starts_with(prefix)
			} else if entry.ends_with('.') || entry.ends_with(':') {
				remote.starts_with(entry.as_str())
			} else {
				remote == entry
			}
		})
	}
}

impl std::fmt::Display for AcceptPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.allow.is_empty() {
			f.write_str("*")
		} else {
			f.write_str(&self.allow.join(","))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_and_star_allow_everyone() {
		assert!(AcceptPolicy::allow_all().allows("203.0.113.9"));
		assert!(AcceptPolicy::parse("10.0.0.1, *").allows("203.0.113.9"));
	}

	#[test]
	fn literal_and_prefix_entries() {
		let policy = AcceptPolicy::parse("127.0.0.1, 192.168.1., fe80:, 10.*");
		assert!(policy.allows("127.0.0.1"));
		assert!(!policy.allows("127.0.0.10"));
		assert!(policy.allows("192.168.1.44"));
		assert!(!policy.allows("192.168.10.4"));
		assert!(policy.allows("fe80::1"));
		assert!(policy.allows("10.20.30.40"));
		assert!(!policy.allows("11.0.0.1"));
	}

	#[test]
	fn display_roundtrips_through_parse() {
		let policy = AcceptPolicy::parse("127.0.0.1,192.168.1.");
		assert_eq!(AcceptPolicy::parse(&policy.to_string()), policy);
		assert_eq!(AcceptPolicy::allow_all().to_string(), "*");
	}
}
