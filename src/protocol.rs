//! Line-oriented peer protocol.
//!
//! A request is one newline-terminated line:
//!
//! ```text
//! LIST
//! FETCH <id> <start_offset> <length>
//! ```
//!
//! `LIST` is answered with one `[<id>] <name> - <size> bytes` line per catalog
//! entry. `FETCH` is answered with exactly `<length>` raw bytes, or the
//! connection is closed without a payload when the id is unknown.

use std::fmt;

use serde::Serialize;

/// A file known to a peer. `id` is local to the peer's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileDescriptor {
    pub id: u64,
    pub name: String,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(id: u64, name: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            size,
        }
    }

    /// Parses one catalog line, without its trailing newline.
    ///
    /// The name is everything between `"] "` and the last `" - "`, so names
    /// containing the separator survive.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (id, rest) = rest.split_once("] ")?;
        let (name, size) = rest.rsplit_once(" - ")?;
        let size = size.strip_suffix(" bytes")?;

        Some(Self {
            id: id.parse().ok()?,
            name: name.to_string(),
            size: size.parse().ok()?,
        })
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} - {} bytes", self.id, self.name, self.size)
    }
}

/// Serializes a catalog as the body of a `LIST` response.
pub fn encode_catalog(files: &[FileDescriptor]) -> String {
    files.iter().map(|f| format!("{}\n", f)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    List,
    Fetch {
        file_id: u64,
        start_offset: u64,
        length: u64,
    },
}

impl Request {
    /// Parses a request line. `DOWNLOAD` is accepted as an alias of `FETCH`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "LIST" => Some(Request::List),
            "FETCH" | "DOWNLOAD" => {
                let file_id = parts.next()?.parse().ok()?;
                let start_offset = parts.next()?.parse().ok()?;
                let length = parts.next()?.parse().ok()?;
                Some(Request::Fetch {
                    file_id,
                    start_offset,
                    length,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::List => writeln!(f, "LIST"),
            Request::Fetch {
                file_id,
                start_offset,
                length,
            } => writeln!(f, "FETCH {} {} {}", file_id, start_offset, length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog_line() {
        let file = FileDescriptor::parse_line("[7] movie.mkv - 1048576 bytes").unwrap();
        assert_eq!(file, FileDescriptor::new(7, "movie.mkv", 1048576));
    }

    #[test]
    fn test_parse_name_with_separator() {
        let file = FileDescriptor::parse_line("[3] a - b.txt - 10 bytes").unwrap();
        assert_eq!(file.name, "a - b.txt");
        assert_eq!(file.size, 10);
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(FileDescriptor::parse_line("").is_none());
        assert!(FileDescriptor::parse_line("7] x - 1 bytes").is_none());
        assert!(FileDescriptor::parse_line("[x] x - 1 bytes").is_none());
        assert!(FileDescriptor::parse_line("[1] x - many bytes").is_none());
        assert!(FileDescriptor::parse_line("[1] x - 1").is_none());
    }

    #[test]
    fn test_encode_catalog() {
        let body = encode_catalog(&[
            FileDescriptor::new(1, "a.txt", 3),
            FileDescriptor::new(2, "b.bin", 0),
        ]);
        assert_eq!(body, "[1] a.txt - 3 bytes\n[2] b.bin - 0 bytes\n");
        assert_eq!(encode_catalog(&[]), "");
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(Request::parse("LIST"), Some(Request::List));
        assert_eq!(
            Request::parse("FETCH 4 64 32"),
            Some(Request::Fetch {
                file_id: 4,
                start_offset: 64,
                length: 32
            })
        );
        assert_eq!(
            Request::parse("DOWNLOAD 4 0 1"),
            Request::parse("FETCH 4 0 1")
        );
        assert_eq!(Request::parse("FETCH 4 0"), None);
        assert_eq!(Request::parse("DELETE 4"), None);
        assert_eq!(Request::parse(""), None);
    }

    #[test]
    fn test_request_wire_form() {
        let req = Request::Fetch {
            file_id: 9,
            start_offset: 32,
            length: 4,
        };
        assert_eq!(req.to_string(), "FETCH 9 32 4\n");
        assert_eq!(Request::List.to_string(), "LIST\n");
    }
}
