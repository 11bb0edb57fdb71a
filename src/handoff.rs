//! The handoff index: how the used set of one generation becomes the inherited set of the
//! next.
//!
//! Every handed-over descriptor gets an ordinal, its position in the list produced by
//! [`FdRegistry::copy`](crate::FdRegistry::copy). The child finds ordinal `n` at descriptor
//! `INHERITED_FDS_START + n`. Names, kinds and ordinals travel separately, as a text index
//! in the environment, one `name;kind;ordinal` entry per line. Inside a name, `\`, `;` and
//! newlines are escaped as `\\`, `\;` and `\n`.

use std::{collections::BTreeMap, fmt::Write, io, os::fd::OwnedFd};

use socket2::{SockRef, Type};

use crate::handle::{FdKind, HandoffFd};

#[derive(Debug, derive_more::Display)]
pub enum HandoffError {
    #[display("malformed index entry on line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[display("unknown kind {kind:?} for {name:?}")]
    UnknownKind { name: String, kind: String },

    #[display("{name:?} appears more than once in the index")]
    DuplicateName { name: String },

    #[display("ordinal {ordinal} is claimed by both {first:?} and {second:?}")]
    DuplicateOrdinal {
        ordinal: usize,
        first: String,
        second: String,
    },

    #[display("descriptor {ordinal} for {name:?} is unusable: {source}")]
    MissingDescriptor {
        name: String,
        ordinal: usize,
        source: io::Error,
    },

    #[display("descriptor {ordinal} for {name:?} is not a {kind}")]
    WrongKind {
        name: String,
        ordinal: usize,
        kind: FdKind,
    },
}

impl std::error::Error for HandoffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MissingDescriptor { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub(crate) name: String,
    pub(crate) kind: FdKind,
    pub(crate) ordinal: usize,
}

fn escape_into(out: &mut String, name: &str) {
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

/// Build the index for `fds`, in order. Ordinal `n` is `fds[n]`.
pub(crate) fn encode(fds: &[HandoffFd]) -> String {
    let mut index = String::new();
    for (ordinal, fd) in fds.iter().enumerate() {
        if ordinal > 0 {
            index.push('\n');
        }
        escape_into(&mut index, fd.name());
        // Writing to a String cannot fail.
        let _ = write!(index, ";{};{ordinal}", fd.kind());
    }
    index
}

fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let unescaped = match c {
            ';' => {
                fields.push(String::new());
                continue;
            }
            '\\' => match chars.next() {
                Some('\\') => '\\',
                Some(';') => ';',
                Some('n') => '\n',
                Some(other) => return Err(format!("unknown escape \\{other}")),
                None => return Err("dangling escape".to_string()),
            },
            c => c,
        };
        if let Some(field) = fields.last_mut() {
            field.push(unescaped);
        }
    }
    Ok(fields)
}

/// Parse an index. Entries come back in index order; names and ordinals are unique.
pub(crate) fn decode(index: &str) -> Result<Vec<IndexEntry>, HandoffError> {
    let mut entries = Vec::new();
    let mut names = BTreeMap::new();
    let mut ordinals: BTreeMap<usize, String> = BTreeMap::new();

    for (i, line) in index.split('\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| HandoffError::Malformed { line: i + 1, reason };

        let fields = split_fields(line).map_err(malformed)?;
        let [name, kind, ordinal] = <[String; 3]>::try_from(fields)
            .map_err(|f| malformed(format!("expected 3 fields, found {}", f.len())))?;

        if name.is_empty() {
            return Err(malformed("empty name".to_string()));
        }
        let Some(kind) = FdKind::from_tag(&kind) else {
            return Err(HandoffError::UnknownKind { name, kind });
        };
        let ordinal: usize = ordinal
            .parse()
            .map_err(|_| malformed(format!("bad ordinal {ordinal:?}")))?;

        if names.insert(name.clone(), ordinal).is_some() {
            return Err(HandoffError::DuplicateName { name });
        }
        if let Some(first) = ordinals.insert(ordinal, name.clone()) {
            return Err(HandoffError::DuplicateOrdinal {
                ordinal,
                first,
                second: name,
            });
        }
        entries.push(IndexEntry {
            name,
            kind,
            ordinal,
        });
    }
    Ok(entries)
}

fn check_kind(fd: &OwnedFd, kind: FdKind) -> bool {
    let expected = match kind {
        FdKind::Listener => Type::STREAM,
        FdKind::PacketConn => Type::DGRAM,
        FdKind::RawFile => return true,
    };
    matches!(SockRef::from(fd).r#type(), Ok(ty) if ty == expected)
}

/// Take ownership of the descriptor behind every entry. `fetch` maps an ordinal to its
/// descriptor.
///
/// Every entry is fetched even after a failure, so that nothing the parent handed over
/// is left open without an owner. The first failure is returned.
pub(crate) fn adopt<F>(entries: Vec<IndexEntry>, mut fetch: F) -> Result<Vec<HandoffFd>, HandoffError>
where
    F: FnMut(usize) -> io::Result<OwnedFd>,
{
    let mut adopted = Vec::with_capacity(entries.len());
    let mut first_error = None;

    for IndexEntry {
        name,
        kind,
        ordinal,
    } in entries
    {
        let result = match fetch(ordinal) {
            Ok(fd) if check_kind(&fd, kind) => Ok(HandoffFd { name, kind, fd }),
            Ok(_) => Err(HandoffError::WrongKind {
                name,
                ordinal,
                kind,
            }),
            Err(source) => Err(HandoffError::MissingDescriptor {
                name,
                ordinal,
                source,
            }),
        };
        match result {
            Ok(fd) => adopted.push(fd),
            Err(e) => {
                log::error!("Cannot adopt inherited descriptor: {e}");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(adopted),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        os::unix::net::{UnixDatagram, UnixListener},
    };

    use super::*;
    use crate::FdRegistry;

    fn entry(name: &str, kind: FdKind, ordinal: usize) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            kind,
            ordinal,
        }
    }

    #[test]
    fn awkward_names_survive_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("a;b")).unwrap();
        let file = tempfile::tempfile().unwrap();
        let fds = vec![
            HandoffFd {
                name: "unix:/tmp/a;b\\c".to_string(),
                kind: FdKind::Listener,
                fd: listener.into(),
            },
            HandoffFd {
                name: "multi\nline".to_string(),
                kind: FdKind::RawFile,
                fd: file.into(),
            },
        ];

        let index = encode(&fds);
        assert_eq!(index.lines().count(), 2);
        assert_eq!(
            decode(&index).unwrap(),
            vec![
                entry("unix:/tmp/a;b\\c", FdKind::Listener, 0),
                entry("multi\nline", FdKind::RawFile, 1),
            ]
        );
    }

    #[test]
    fn empty_index_is_generation_zero() {
        assert_eq!(encode(&[]), "");
        assert!(decode("").unwrap().is_empty());
        assert!(decode("\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for index in [
            "tcp:1.2.3.4:80;listener",
            "tcp:1.2.3.4:80;listener;0;extra",
            "tcp:1.2.3.4:80;listener;-1",
            ";listener;0",
            "bad\\escape;listener;0",
            "dangling\\",
        ] {
            assert!(
                matches!(decode(index), Err(HandoffError::Malformed { line: 1, .. })),
                "{index:?} should be malformed"
            );
        }
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(matches!(
            decode("seqpacket:/tmp/s;seqpacket;0"),
            Err(HandoffError::UnknownKind { .. })
        ));
    }

    #[test]
    fn duplicates_are_rejected() {
        assert!(matches!(
            decode("a;raw-file;0\na;raw-file;1"),
            Err(HandoffError::DuplicateName { .. })
        ));
        assert!(matches!(
            decode("a;raw-file;0\nb;raw-file;0"),
            Err(HandoffError::DuplicateOrdinal { ordinal: 0, .. })
        ));
    }

    #[test]
    fn adopt_checks_kinds_and_keeps_going() {
        let file = tempfile::tempfile().unwrap();
        let gram = UnixDatagram::unbound().unwrap();
        let mut slots: Vec<Option<OwnedFd>> = vec![Some(file.into()), Some(gram.into())];
        let fetched = std::cell::Cell::new(0);

        let entries = vec![
            entry("not-a-listener", FdKind::Listener, 0),
            entry("unixgram:", FdKind::PacketConn, 1),
            entry("gone", FdKind::RawFile, 7),
        ];
        let result = adopt(entries, |ordinal| {
            fetched.set(fetched.get() + 1);
            slots
                .get_mut(ordinal)
                .and_then(Option::take)
                .ok_or_else(|| io::Error::from_raw_os_error(ebadf()))
        });

        assert!(matches!(
            result,
            Err(HandoffError::WrongKind {
                ordinal: 0,
                kind: FdKind::Listener,
                ..
            })
        ));
        assert_eq!(fetched.get(), 3);
    }

    fn ebadf() -> i32 {
        nix::errno::Errno::EBADF as i32
    }

    #[test]
    fn missing_descriptor_is_reported() {
        let result = adopt(vec![entry("gone", FdKind::RawFile, 0)], |_| {
            Err(io::Error::from_raw_os_error(ebadf()))
        });
        assert!(matches!(
            result,
            Err(HandoffError::MissingDescriptor { ordinal: 0, .. })
        ));
    }

    #[test]
    fn registry_survives_encode_and_adopt() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let parent = FdRegistry::new();
        let listener = parent.listen("tcp", "127.0.0.1:0").unwrap();
        let addr = listener.as_tcp().unwrap().local_addr().unwrap();
        parent.add_file("pipe", &w).unwrap();
        drop(w);

        let copied = parent.copy().unwrap();
        let index = encode(&copied);
        let mut slots: Vec<Option<OwnedFd>> = copied.into_iter().map(|f| Some(f.fd)).collect();
        let inherited = adopt(decode(&index).unwrap(), |ordinal| {
            slots
                .get_mut(ordinal)
                .and_then(Option::take)
                .ok_or_else(|| io::Error::from_raw_os_error(ebadf()))
        })
        .unwrap();

        let child = FdRegistry::from_inherited(inherited);
        let inherited = child.listen("tcp", "127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = inherited.as_tcp().unwrap().accept().unwrap();
        client.write_all(b"x").unwrap();
        let mut buf = [0; 1];
        server.read_exact(&mut buf).unwrap();

        child.file("pipe").unwrap().write_all(b"y").unwrap();
        std::fs::File::from(r).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"y");
    }
}
