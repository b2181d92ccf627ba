//! Derives human-readable test identifiers from executable file names.

/// Strips the build-hash suffix and a trailing `.exe` extension from a test
/// executable name.
///
/// Cargo names test binaries `<test>-<metadata hash>`, so the last
/// hyphen-delimited segment is dropped when it parses as hexadecimal. If it
/// does not parse, the name is assumed to carry no hash and is returned
/// unchanged apart from the extension.
pub fn clean_test_name(name: &str) -> String {
    let name = name.strip_suffix(".exe").unwrap_or(name);
    if let Some((last, rest)) = name.split('-').collect::<Vec<_>>().split_last() {
        if !rest.is_empty() && u128::from_str_radix(last, 16).is_ok() {
            // Rejoin with '-' in case the test name itself contains hyphens.
            return rest.join("-");
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_hash() {
        assert_eq!(clean_test_name("basic_math-53081ec41ab9ff2d"), "basic_math");
    }

    #[test]
    fn strips_extension_and_hash() {
        assert_eq!(clean_test_name("basic_math-53081ec41ab9ff2d.exe"), "basic_math");
    }

    #[test]
    fn strips_extension_without_hash() {
        assert_eq!(clean_test_name("demo.exe"), "demo");
    }

    #[test]
    fn rejoins_hyphenated_names() {
        assert_eq!(clean_test_name("net-loopback-1a2b3c"), "net-loopback");
    }

    #[test]
    fn keeps_names_without_a_hash() {
        assert_eq!(clean_test_name("hello-world"), "hello-world");
        assert_eq!(clean_test_name("hermit"), "hermit");
    }

    #[test]
    fn hex_parse_failure_is_not_fatal() {
        assert_eq!(clean_test_name("guest-"), "guest-");
        assert_eq!(clean_test_name("-deadbeef"), "");
    }

    #[test]
    fn uppercase_hashes_are_recognized() {
        assert_eq!(clean_test_name("guest-DEADBEEF"), "guest");
    }
}
