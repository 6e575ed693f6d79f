//! String plumbing for `CreateProcessW`
//!
//! Pure conversions from the request's UTF-8 strings into the UTF-16 shapes the
//! pseudo-console launcher hands to the OS: null-terminated strings, a quoted
//! command line, and a double-null-terminated environment block. Kept free of
//! OS calls so it builds and is tested on every target.

use std::iter;
use std::path::Path;

/// UTF-16 with a trailing NUL
pub(crate) fn wide_null(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

/// A path as a null-terminated wide string
pub(crate) fn wide_path(path: &Path) -> Vec<u16> {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        path.as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect()
    }
    #[cfg(not(windows))]
    {
        wide_null(&path.to_string_lossy())
    }
}

/// Append `arg` to `out`, quoted so the MSVC runtime parses it back as one argument
pub(crate) fn quote_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty() || arg.contains(&[' ', '\t', '\n', '\u{b}', '"'][..]);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        if c == '\\' {
            backslashes += 1;
            continue;
        }
        // Backslashes only escape when they precede a quote
        let escaped = if c == '"' { backslashes * 2 + 1 } else { backslashes };
        out.extend(iter::repeat('\\').take(escaped));
        out.push(c);
        backslashes = 0;
    }
    // Double trailing backslashes so they don't escape the closing quote
    out.extend(iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// Mutable, null-terminated command line: the executable followed by `args`
pub(crate) fn command_line(executable: &str, args: &[&str]) -> Vec<u16> {
    let mut line = String::new();
    quote_arg(executable, &mut line);
    for arg in args {
        line.push(' ');
        quote_arg(arg, &mut line);
    }
    wide_null(&line)
}

/// Environment block for `CREATE_UNICODE_ENVIRONMENT`.
///
/// Entries are sorted by name ignoring case, each one null-terminated, with an
/// extra NUL closing the block.
pub(crate) fn environment_block(entries: &[String]) -> Vec<u16> {
    let mut sorted: Vec<&String> = entries.iter().collect();
    sorted.sort_by_cached_key(|entry| variable_name(entry).to_uppercase());

    let mut block: Vec<u16> = sorted
        .into_iter()
        .flat_map(|entry| entry.encode_utf16().chain(iter::once(0)))
        .collect();
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Name part of `NAME=VALUE`. A leading `=` belongs to the name (`=C:=C:\dir`).
fn variable_name(entry: &str) -> &str {
    match entry.char_indices().skip(1).find(|&(_, c)| c == '=') {
        Some((index, _)) => &entry[..index],
        None => entry,
    }
}

/// Snapshot of the current process environment as `NAME=VALUE` entries.
///
/// Variables that aren't valid Unicode are skipped.
pub(crate) fn inherited_environment() -> Vec<String> {
    std::env::vars_os()
        .filter_map(|(name, value)| {
            let name = name.into_string().ok()?;
            let value = value.into_string().ok()?;
            Some(format!("{name}={value}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quoted(arg: &str) -> String {
        let mut out = String::new();
        quote_arg(arg, &mut out);
        out
    }

    fn from_wide(wide: &[u16]) -> String {
        String::from_utf16(wide).unwrap()
    }

    #[test]
    fn test_wide_null() {
        assert_eq!(wide_null("ab"), vec![b'a' as u16, b'b' as u16, 0]);
        assert_eq!(wide_null(""), vec![0]);
        // non-BMP characters become surrogate pairs
        assert_eq!(wide_null("\u{1F600}").len(), 3);
    }

    #[test]
    fn test_wide_path_converts_source_directly() {
        let wide = wide_path(Path::new("C:\\work dir"));
        assert_eq!(from_wide(&wide[..wide.len() - 1]), "C:\\work dir");
        assert_eq!(wide.last(), Some(&0));
    }

    #[test]
    fn test_quote_plain() {
        assert_eq!(quoted("cmd.exe"), "cmd.exe");
        assert_eq!(quoted("C:\\dir\\"), "C:\\dir\\");
    }

    #[test]
    fn test_quote_empty() {
        assert_eq!(quoted(""), "\"\"");
    }

    #[test]
    fn test_quote_spaces() {
        assert_eq!(quoted("a b"), "\"a b\"");
        assert_eq!(quoted("C:\\Program Files\\"), "\"C:\\Program Files\\\\\"");
    }

    #[test]
    fn test_quote_embedded_quotes() {
        assert_eq!(quoted("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quoted("a\\\"b"), "\"a\\\\\\\"b\"");
    }

    #[test]
    fn test_command_line_separates_arguments() {
        let line = command_line("C:\\Windows\\System32\\cmd.exe", &["/c", "echo hi"]);
        assert_eq!(
            from_wide(&line[..line.len() - 1]),
            "C:\\Windows\\System32\\cmd.exe /c \"echo hi\""
        );
        assert_eq!(line.last(), Some(&0));
    }

    #[test]
    fn test_environment_block_layout() {
        let block = environment_block(&["b=2".to_string(), "A=1".to_string()]);
        let text = from_wide(&block);
        assert_eq!(text, "A=1\0b=2\0\0");
    }

    #[test]
    fn test_empty_environment_block() {
        assert_eq!(environment_block(&[]), vec![0, 0]);
    }

    #[test]
    fn test_variable_name_with_leading_equals() {
        assert_eq!(variable_name("=C:=C:\\dir"), "=C:");
        assert_eq!(variable_name("PATH=x=y"), "PATH");
        assert_eq!(variable_name("NOVALUE"), "NOVALUE");
    }

    #[test]
    fn test_inherited_environment_entries() {
        for entry in inherited_environment() {
            assert!(entry.contains('='), "entry without separator: {entry}");
        }
    }

    proptest! {
        #[test]
        fn plain_args_are_unchanged(arg in "[A-Za-z0-9_.:/\\\\-]{1,32}") {
            prop_assert_eq!(quoted(&arg), arg);
        }

        #[test]
        fn args_with_whitespace_are_wrapped(prefix in "[a-z]{0,8}", suffix in "[a-z]{0,8}") {
            let arg = format!("{prefix} {suffix}");
            let out = quoted(&arg);
            prop_assert!(out.starts_with('"'));
            prop_assert!(out.ends_with('"'));
            prop_assert_eq!(&out[1..out.len() - 1], arg.as_str());
        }

        #[test]
        fn environment_block_is_double_null_terminated(
            entries in proptest::collection::vec("[A-Z]{1,6}=[a-z0-9]{0,6}", 0..8)
        ) {
            let block = environment_block(&entries);
            prop_assert!(block.len() >= 2);
            prop_assert_eq!(&block[block.len() - 2..], &[0u16, 0][..]);
            let nuls = block.iter().filter(|&&unit| unit == 0).count();
            prop_assert_eq!(nuls, entries.len().max(1) + 1);
        }
    }
}
