//! File comparisons behind the `match` and `rmatch` pass conditions.

use crate::results::TestResult;
use regex::bytes::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Size of the chunks read from each side of a byte comparison.
pub const MATCH_READ_BUFFER_SIZE: usize = 1024;

/// Check that all `files` are byte-identical.
///
/// Consecutive files are compared pairwise in list order. A file that cannot
/// be opened fails the rule but the remaining files are still compared.
/// Returns whether every comparison succeeded.
pub fn match_files(dir: &Path, index: usize, files: &[String], result: &mut TestResult) -> bool {
    if files.len() < 2 {
        result.warn(format!(
            "Not enough filenames provided for match rule ({index})"
        ));
        return true;
    }

    let mut ok = true;
    let mut opened = Vec::with_capacity(files.len());
    for name in files {
        match File::open(dir.join(name)) {
            Ok(file) => opened.push((name, file)),
            Err(e) => {
                result.fail(format!("Unable to open file for comparison: {name}: {e}"));
                ok = false;
            }
        }
    }

    for pair in opened.windows(2) {
        let [(left_name, left), (right_name, right)] = pair else {
            continue;
        };
        match same_contents(left, right) {
            Ok(true) => result.info(format!("Files match: {left_name}, {right_name}")),
            Ok(false) => {
                result.fail(format!("Files don't match: {left_name}, {right_name}"));
                ok = false;
            }
            Err(e) => {
                result.fail(format!(
                    "Unable to read files for comparison: {left_name}, {right_name}: {e}"
                ));
                ok = false;
            }
        }
    }
    ok
}

/// Compare two readers chunk by chunk until both are exhausted.
fn same_contents(mut left: impl Read, mut right: impl Read) -> io::Result<bool> {
    let mut left_buf = [0u8; MATCH_READ_BUFFER_SIZE];
    let mut right_buf = [0u8; MATCH_READ_BUFFER_SIZE];
    loop {
        let left_len = read_chunk(&mut left, &mut left_buf)?;
        let right_len = read_chunk(&mut right, &mut right_buf)?;
        if left_len != right_len || left_buf[..left_len] != right_buf[..right_len] {
            return Ok(false);
        }
        if left_len == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the reader allows. Returns fewer bytes only at end of input.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Check that every file after the first contains a match for the regular
/// expression stored in the first.
///
/// Returns whether the rule passed.
pub fn rmatch_files(dir: &Path, index: usize, files: &[String], result: &mut TestResult) -> bool {
    let [pattern_name, subjects @ ..] = files else {
        result.warn(format!(
            "Not enough filenames provided for rmatch rule ({index})"
        ));
        return true;
    };
    if subjects.is_empty() {
        result.warn(format!(
            "Not enough filenames provided for rmatch rule ({index})"
        ));
        return true;
    }

    let pattern = match std::fs::read(dir.join(pattern_name)) {
        Ok(bytes) => bytes,
        Err(e) => {
            result.fail(format!(
                "Unable to open regular expression file: {pattern_name}: {e}"
            ));
            return false;
        }
    };
    if pattern.is_empty() {
        result.warn(format!(
            "Zero-length regular expression file: {pattern_name}"
        ));
    }

    let re = match Regex::new(&String::from_utf8_lossy(&pattern)) {
        Ok(re) => re,
        Err(e) => {
            result.fail(format!(
                "Unable to compile regular expression file: {pattern_name}: {e}"
            ));
            return false;
        }
    };

    let mut ok = true;
    for subject in subjects {
        match std::fs::read(dir.join(subject)) {
            Ok(contents) if re.is_match(&contents) => {
                result.info(format!(
                    "Files match (using regular expression): {pattern_name}, {subject}"
                ));
            }
            Ok(_) => {
                result.fail(format!(
                    "Files don't match (using regular expression): {pattern_name}, {subject}"
                ));
                ok = false;
            }
            Err(e) => {
                result.fail(format!("Unable to open file for comparison: {subject}: {e}"));
                ok = false;
            }
        }
    }
    ok
}
