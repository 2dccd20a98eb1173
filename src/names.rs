use rand::Rng;

use crate::error::McpvmError;

/// Every VM name starts with this prefix. The full name doubles as the
/// guest's mDNS hostname component, so it must stay a valid DNS label.
pub const NAME_PREFIX: &str = "mcpvm";

/// Attempts before giving up on finding a collision-free name.
const MAX_ATTEMPTS: u32 = 32;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crisp", "eager", "fancy", "fleet", "gentle",
    "jolly", "keen", "lively", "lucky", "mellow", "nimble", "plucky", "quiet", "rapid", "rustic",
    "snappy", "sturdy", "sunny", "swift", "tidy", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "bee", "crane", "falcon", "ferret", "finch", "fox", "heron", "lark", "lynx",
    "marmot", "marten", "otter", "owl", "pike", "raven", "robin", "shrew", "sparrow", "stoat",
    "swift", "tern", "trout", "vole", "wren",
];

/// Whether a name follows the tool's naming convention: the `mcpvm-` prefix
/// followed by at least one character, lowercase alphanumerics and dashes
/// only (no periods, since the name is used as a hostname), at most 63 chars.
pub fn is_valid_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("mcpvm-") else {
        return false;
    };
    !rest.is_empty()
        && name.len() <= 63
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Generate a free `mcpvm-<adjective>-<noun>` name.
///
/// `taken` reports whether a candidate is already in use; generation retries
/// up to a fixed bound and fails rather than looping forever on a crowded
/// namespace.
pub fn generate_name<R, F>(rng: &mut R, taken: F) -> Result<String, McpvmError>
where
    R: Rng,
    F: Fn(&str) -> bool,
{
    for _ in 0..MAX_ATTEMPTS {
        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
        let candidate = format!("{NAME_PREFIX}-{adjective}-{noun}");
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(McpvmError::NameGeneration {
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn generated_names_match_convention() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let name = generate_name(&mut rng, |_| false).unwrap();
            assert!(is_valid_name(&name), "bad generated name: {name}");
        }
    }

    #[test]
    fn generation_skips_taken_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let first = generate_name(&mut rng, |_| false).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let second = generate_name(&mut rng, |n| n == first).unwrap();
        assert_ne!(first, second);
        assert!(is_valid_name(&second));
    }

    #[test]
    fn generation_fails_when_namespace_saturated() {
        let mut rng = StdRng::seed_from_u64(7);
        let err = generate_name(&mut rng, |_| true).unwrap_err();
        assert!(err.to_string().contains("could not generate"));
    }

    #[test]
    fn valid_name_requires_prefix() {
        assert!(is_valid_name("mcpvm-swift-otter"));
        assert!(is_valid_name("mcpvm-ci-42"));
        assert!(!is_valid_name("swift-otter"));
        assert!(!is_valid_name("mcpvm"));
        assert!(!is_valid_name("mcpvm-"));
    }

    #[test]
    fn valid_name_rejects_hostname_unsafe_chars() {
        assert!(!is_valid_name("mcpvm-a.b"));
        assert!(!is_valid_name("mcpvm-Upper"));
        assert!(!is_valid_name("mcpvm-under_score"));
        assert!(!is_valid_name("mcpvm-trailing-"));
        let long = format!("mcpvm-{}", "a".repeat(64));
        assert!(!is_valid_name(&long));
    }
}
