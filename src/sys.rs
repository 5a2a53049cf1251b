//! Thin system helpers: date and time strings for the server's start
//! stamp, errno rendering for error messages, small file utilities, and a
//! KEY=VALUE environment-file loader for applications built on top of the
//! core.

use std::fs;
use std::path::Path;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::Error;
use crate::Result;

/// Current date as `dd.mm.yyyy`.
///
/// Falls back to UTC when the local offset cannot be determined (the time
/// crate refuses local lookups in multithreaded processes).
pub fn current_date() -> Result<String> {
    let format = format_description!("[day].[month].[year]");
    now()
        .format(format)
        .map_err(|e| Error::SystemRuntime(format!("formatting the current date failed: {e}")))
}

/// Current time as `hh:mm:ss`.
pub fn current_time() -> Result<String> {
    let format = format_description!("[hour]:[minute]:[second]");
    now()
        .format(format)
        .map_err(|e| Error::SystemRuntime(format!("formatting the current time failed: {e}")))
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Seconds since the UNIX epoch.
pub(crate) fn epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The last OS error, rendered the way it is embedded in crate error
/// messages.
pub fn errno_message() -> String {
    std::io::Error::last_os_error().to_string()
}

/// Read a whole file into a string.
pub fn read_file(path: &Path) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("file path cannot be empty".into()));
    }
    fs::read_to_string(path)
        .map_err(|e| Error::SystemRuntime(format!("reading {} failed: {e}", path.display())))
}

/// Write `data` to a file, replacing existing contents.
pub fn write_file(path: &Path, data: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("file path cannot be empty".into()));
    }
    if data.is_empty() {
        return Err(Error::InvalidArgument("data to write cannot be empty".into()));
    }
    fs::write(path, data)
        .map_err(|e| Error::SystemRuntime(format!("writing {} failed: {e}", path.display())))
}

/// Size of a file in bytes.
pub fn file_size(path: &Path) -> Result<u64> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("file path cannot be empty".into()));
    }
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::SystemRuntime(format!("inspecting {} failed: {e}", path.display())))
}

/// Load environment variables from a `KEY=VALUE` file, one pair per line,
/// no spaces around the separator. Lines without a separator and blank
/// lines are skipped; the file contents are not otherwise validated.
pub fn load_env_file(path: &Path) -> Result<()> {
    let contents = read_file(path)?;
    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_and_time_have_the_documented_shapes() {
        let date = current_date().expect("current date");
        // dd.mm.yyyy
        assert_eq!(date.len(), 10);
        let parts: Vec<&str> = date.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 4);

        let time = current_time().expect("current time");
        // hh:mm:ss
        assert_eq!(time.len(), 8);
        assert_eq!(time.split(':').count(), 3);
    }

    #[test]
    fn file_round_trip_and_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("note.txt");

        write_file(&path, "hello").expect("write");
        assert_eq!(read_file(&path).expect("read"), "hello");
        assert_eq!(file_size(&path).expect("size"), 5);

        assert!(matches!(
            write_file(&path, ""),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            read_file(Path::new("")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            read_file(&dir.path().join("missing")),
            Err(Error::SystemRuntime(_))
        ));
    }

    #[test]
    fn env_loader_sets_pairs_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("env");
        write_file(
            &path,
            "SOCKMUX_TEST_A=1\n\nnot a pair\nSOCKMUX_TEST_B=two=halves\n",
        )
        .expect("write env file");

        load_env_file(&path).expect("load env");
        assert_eq!(std::env::var("SOCKMUX_TEST_A").unwrap(), "1");
        // Only the first separator splits; the rest is the value.
        assert_eq!(std::env::var("SOCKMUX_TEST_B").unwrap(), "two=halves");
    }
}
