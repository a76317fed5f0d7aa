//! SCP Protocol Parser
//!
//! Parses SCP commands from exec requests and SCP protocol records.

use super::types::{ScpCommand, ScpOptions, ScpRecord};

/// SCP Protocol Parser
#[derive(Default)]
pub struct ScpParser;

impl ScpParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse an exec command to determine if it's SCP.
    ///
    /// Only the exact form `scp [-v] [-r] [-p] [-d] (-t|-f) <path>` is
    /// accepted, options separated by single spaces. Anything else that
    /// starts with `scp ` is [`ScpCommand::Invalid`].
    pub fn parse_command(&self, command: &str) -> Option<ScpCommand> {
        let mut rest = command.strip_prefix("scp ")?;
        let mut options = ScpOptions::default();

        loop {
            if let Some(r) = rest.strip_prefix("-v ") {
                rest = r;
            } else if let Some(r) = rest.strip_prefix("-r ") {
                options.recursive = true;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("-p ") {
                options.preserve_times = true;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("-d ") {
                options.target_is_dir = true;
                rest = r;
            } else {
                break;
            }
        }

        if let Some(path) = rest.strip_prefix("-t ") {
            Some(ScpCommand::Sink {
                path: path.to_string(),
                options,
            })
        } else if let Some(path) = rest.strip_prefix("-f ") {
            Some(ScpCommand::Source {
                path: path.to_string(),
                options,
            })
        } else {
            Some(ScpCommand::Invalid {
                command: command.to_string(),
            })
        }
    }

    /// Parse one command record, without its trailing newline.
    pub fn parse_record(&self, line: &[u8]) -> Option<ScpRecord> {
        let line = String::from_utf8_lossy(line);
        let mut chars = line.chars();

        match chars.next()? {
            'T' => self.parse_times(chars.as_str()),
            'C' => {
                let (mode, size, name) = self.parse_file_header(chars.as_str())?;
                Some(ScpRecord::File { mode, size, name })
            }
            'D' => {
                let (mode, _, name) = self.parse_file_header(chars.as_str())?;
                Some(ScpRecord::Dir { mode, name })
            }
            'E' => Some(ScpRecord::EndDir),
            _ => None,
        }
    }

    fn parse_times(&self, body: &str) -> Option<ScpRecord> {
        // Format: T<mtime> <usec> <atime> <usec>
        let fields = body
            .split_whitespace()
            .take(4)
            .map(|f| f.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() != 4 {
            return None;
        }
        Some(ScpRecord::Times {
            mtime: fields[0],
            atime: fields[2],
        })
    }

    fn parse_file_header(&self, body: &str) -> Option<(u32, u64, String)> {
        // Format: <mode> <size> <filename>, either number possibly empty
        let mode_len = body.find(|c: char| !('0'..='7').contains(&c))?;
        let mode = body[..mode_len]
            .bytes()
            .try_fold(0u32, |acc, b| acc.checked_mul(8)?.checked_add((b - b'0') as u32))?;
        let body = body[mode_len..].strip_prefix(' ')?;

        let size_len = body.find(|c: char| !c.is_ascii_digit())?;
        let size = if size_len == 0 {
            0
        } else {
            body[..size_len].parse().ok()?
        };
        let name = body[size_len..].strip_prefix(' ')?;

        Some((mode, size, name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(path: &str, options: ScpOptions) -> Option<ScpCommand> {
        Some(ScpCommand::Sink {
            path: path.to_string(),
            options,
        })
    }

    #[test]
    fn test_parse_sink_command() {
        let parser = ScpParser::new();

        let result = parser.parse_command("scp -t /tmp/dest");
        assert_eq!(result, sink("/tmp/dest", ScpOptions::default()));
    }

    #[test]
    fn test_parse_sink_options() {
        let parser = ScpParser::new();

        let result = parser.parse_command("scp -v -r -d -t /tmp/dest dir");
        assert_eq!(
            result,
            sink(
                "/tmp/dest dir",
                ScpOptions {
                    recursive: true,
                    target_is_dir: true,
                    ..Default::default()
                }
            )
        );
    }

    #[test]
    fn test_parse_source_command() {
        let parser = ScpParser::new();

        let result = parser.parse_command("scp -r -p -f /tmp/source");
        assert_eq!(
            result,
            Some(ScpCommand::Source {
                path: "/tmp/source".to_string(),
                options: ScpOptions {
                    recursive: true,
                    preserve_times: true,
                    target_is_dir: false,
                },
            })
        );
    }

    #[test]
    fn test_parse_invalid_command() {
        let parser = ScpParser::new();

        for command in ["scp -x -t foo", "scp foo", "scp  -t foo", "scp -t"] {
            assert_eq!(
                parser.parse_command(command),
                Some(ScpCommand::Invalid {
                    command: command.to_string()
                })
            );
        }
    }

    #[test]
    fn test_parse_not_scp() {
        let parser = ScpParser::new();

        assert_eq!(parser.parse_command("ls -la"), None);
        assert_eq!(parser.parse_command(""), None);
        assert_eq!(parser.parse_command("scp"), None);
        assert_eq!(parser.parse_command("/usr/bin/scp -t /tmp"), None);
    }

    #[test]
    fn test_parse_file_record() {
        let parser = ScpParser::new();

        let result = parser.parse_record(b"C0644 1234 my file.txt");
        assert_eq!(
            result,
            Some(ScpRecord::File {
                mode: 0o644,
                size: 1234,
                name: "my file.txt".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_file_record_empty_numbers() {
        let parser = ScpParser::new();

        let result = parser.parse_record(b"C  f");
        assert_eq!(
            result,
            Some(ScpRecord::File {
                mode: 0,
                size: 0,
                name: "f".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_dir_record() {
        let parser = ScpParser::new();

        let result = parser.parse_record(b"D0755 0 mydir");
        assert_eq!(
            result,
            Some(ScpRecord::Dir {
                mode: 0o755,
                name: "mydir".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_malformed_records() {
        let parser = ScpParser::new();

        assert_eq!(parser.parse_record(b"C0689 1 f"), None);
        assert_eq!(parser.parse_record(b"C0644 12x f"), None);
        assert_eq!(parser.parse_record(b"C0644"), None);
        assert_eq!(parser.parse_record(b"T1 0 2"), None);
        assert_eq!(parser.parse_record(b"X"), None);
        assert_eq!(parser.parse_record(b""), None);
    }

    #[test]
    fn test_parse_times_record() {
        let parser = ScpParser::new();

        assert_eq!(
            parser.parse_record(b"T1700000000 0 1600000000 0"),
            Some(ScpRecord::Times {
                mtime: 1700000000,
                atime: 1600000000,
            })
        );
    }

    #[test]
    fn test_parse_end_dir() {
        let parser = ScpParser::new();

        assert_eq!(parser.parse_record(b"E"), Some(ScpRecord::EndDir));
    }
}
