//! # Worker addresses and command-line assembly.
//!
//! [`ConnectUrl`] is the address a worker's bridge acceptor listens on, either
//! a TCP socket or a named pipe. The same value is rendered three ways:
//! as the `--accept=` string handed to the worker, as a stable fragment for
//! naming the instance working directory, and as a short display form for logs.
//!
//! [`WorkerCommand`] assembles the full headless invocation for one worker
//! instance. [`ProcessQuery`] is the matching side of the same coin: it carries
//! the markers a [`ProcessTransport`](crate::ProcessTransport) uses to find a
//! running worker in the process table.

use std::fmt;
use std::path::{Path, PathBuf};

/// Flags passed to every spawned worker instance.
///
/// `--headless` and friends keep the process UI-less and independent from any
/// desktop session; `--norestore` prevents crash-recovery dialogs from blocking
/// a respawned instance on the profile of a crashed one.
const DEFAULT_FLAGS: &[&str] = &[
    "--headless",
    "--invisible",
    "--nocrashreport",
    "--nodefault",
    "--nofirststartwizard",
    "--nolockcheck",
    "--nologo",
    "--norestore",
];

/// Command marker used to recognize worker processes in the process table.
const COMMAND_MARKER: &str = "soffice";

/// Address of a worker's bridge acceptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectUrl {
    /// TCP socket acceptor.
    Socket {
        /// Interface the worker binds to.
        host: String,
        /// Port the worker listens on.
        port: u16,
    },
    /// Named pipe acceptor.
    Pipe {
        /// Pipe name, unique per worker instance.
        name: String,
    },
}

impl ConnectUrl {
    /// Creates a loopback socket address on the given port.
    pub fn socket(port: u16) -> Self {
        ConnectUrl::Socket {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Creates a socket address on an explicit host.
    pub fn socket_on(host: impl Into<String>, port: u16) -> Self {
        ConnectUrl::Socket {
            host: host.into(),
            port,
        }
    }

    /// Creates a named-pipe address.
    pub fn pipe(name: impl Into<String>) -> Self {
        ConnectUrl::Pipe { name: name.into() }
    }

    /// Renders the acceptor description handed to the worker via `--accept=`.
    ///
    /// # Example
    /// ```
    /// use officevisor::ConnectUrl;
    ///
    /// let url = ConnectUrl::socket(2002);
    /// assert_eq!(
    ///     url.accept_string(),
    ///     "socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;StarOffice.ServiceManager"
    /// );
    /// ```
    pub fn accept_string(&self) -> String {
        match self {
            ConnectUrl::Socket { host, port } => {
                format!("socket,host={host},port={port},tcpNoDelay=1;urp;StarOffice.ServiceManager")
            }
            ConnectUrl::Pipe { name } => {
                format!("pipe,name={name};urp;StarOffice.ServiceManager")
            }
        }
    }

    /// Renders a stable fragment used to derive the instance directory name.
    ///
    /// The fragment contains no path separators and is unique per address, so
    /// two workers never share a working directory.
    pub fn dir_fragment(&self) -> String {
        match self {
            ConnectUrl::Socket { host, port } => format!("socket_host-{host}_port-{port}"),
            ConnectUrl::Pipe { name } => format!("pipe_name-{name}"),
        }
    }
}

impl fmt::Display for ConnectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectUrl::Socket { host, port } => write!(f, "{host}:{port}"),
            ConnectUrl::Pipe { name } => write!(f, "pipe:{name}"),
        }
    }
}

/// Markers a process transport matches against the process table.
///
/// A worker is recognized by its binary name plus the accept string on its
/// command line; the accept string is unique per [`ConnectUrl`], so the query
/// never matches a worker belonging to a different entry.
#[derive(Clone, Debug)]
pub struct ProcessQuery {
    /// Substring expected in the process command/binary name.
    pub command: String,
    /// Substring expected among the process arguments.
    pub argument: String,
}

impl ProcessQuery {
    /// Builds the query matching the worker serving `url`.
    pub fn for_url(url: &ConnectUrl) -> Self {
        Self {
            command: COMMAND_MARKER.to_string(),
            argument: url.accept_string(),
        }
    }
}

/// Fully assembled invocation for one worker instance.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    /// Program to execute. This is the first run-as argument when run-as
    /// arguments are configured (sudo-style wrappers), the office binary
    /// otherwise.
    pub program: PathBuf,
    /// Arguments in order, including the office binary itself when a run-as
    /// wrapper is in front.
    pub args: Vec<String>,
    /// The acceptor description embedded in the arguments; doubles as the
    /// process-table marker.
    pub accept: String,
    /// Instance working directory; also the process working directory.
    pub working_dir: PathBuf,
}

impl WorkerCommand {
    /// Assembles the invocation for a worker bound to `url`.
    ///
    /// The user profile of the instance lives under `instance_dir`, passed to
    /// the worker via `-env:UserInstallation`, which is what allows several
    /// instances to run side by side.
    pub fn new(
        office_home: &Path,
        url: &ConnectUrl,
        instance_dir: &Path,
        run_as_args: &[String],
    ) -> Self {
        let accept = url.accept_string();
        let binary = office_home.join("program").join("soffice.bin");

        let (program, mut args) = match run_as_args.split_first() {
            Some((wrapper, rest)) => {
                let mut args: Vec<String> = rest.to_vec();
                args.push(binary.display().to_string());
                (PathBuf::from(wrapper), args)
            }
            None => (binary, Vec::new()),
        };

        args.push(format!("--accept={accept}"));
        args.push(format!(
            "-env:UserInstallation=file://{}",
            instance_dir.display()
        ));
        args.extend(DEFAULT_FLAGS.iter().map(|flag| flag.to_string()));

        Self {
            program,
            args,
            accept,
            working_dir: instance_dir.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_accept_string() {
        let url = ConnectUrl::socket_on("10.0.0.5", 8100);
        assert_eq!(
            url.accept_string(),
            "socket,host=10.0.0.5,port=8100,tcpNoDelay=1;urp;StarOffice.ServiceManager"
        );
    }

    #[test]
    fn test_pipe_accept_string() {
        let url = ConnectUrl::pipe("office1");
        assert_eq!(
            url.accept_string(),
            "pipe,name=office1;urp;StarOffice.ServiceManager"
        );
    }

    #[test]
    fn test_dir_fragment_has_no_separators() {
        for url in [ConnectUrl::socket(2002), ConnectUrl::pipe("office1")] {
            let fragment = url.dir_fragment();
            assert!(!fragment.contains('/'), "fragment {fragment:?} has a slash");
            assert!(!fragment.contains(','), "fragment {fragment:?} has a comma");
        }
    }

    #[test]
    fn test_dir_fragments_unique_per_address() {
        let a = ConnectUrl::socket(2002).dir_fragment();
        let b = ConnectUrl::socket(2003).dir_fragment();
        assert_ne!(a, b);
    }

    #[test]
    fn test_command_without_run_as_args() {
        let url = ConnectUrl::socket(2002);
        let cmd = WorkerCommand::new(
            Path::new("/opt/libreoffice"),
            &url,
            Path::new("/tmp/work/.officevisor_socket_host-127.0.0.1_port-2002"),
            &[],
        );

        assert_eq!(
            cmd.program,
            PathBuf::from("/opt/libreoffice/program/soffice.bin")
        );
        assert!(cmd.args[0].starts_with("--accept=socket,host=127.0.0.1,port=2002"));
        assert!(cmd.args[1].starts_with("-env:UserInstallation=file:///tmp/work/"));
        assert!(cmd.args.contains(&"--headless".to_string()));
        assert!(cmd.args.contains(&"--norestore".to_string()));
    }

    #[test]
    fn test_command_with_run_as_wrapper() {
        let url = ConnectUrl::socket(2002);
        let run_as = vec!["sudo".to_string(), "-u".to_string(), "office".to_string()];
        let cmd = WorkerCommand::new(Path::new("/opt/libreoffice"), &url, Path::new("/tmp/w"), &run_as);

        assert_eq!(cmd.program, PathBuf::from("sudo"));
        assert_eq!(cmd.args[0], "-u");
        assert_eq!(cmd.args[1], "office");
        assert_eq!(cmd.args[2], "/opt/libreoffice/program/soffice.bin");
        assert!(cmd.args[3].starts_with("--accept="));
    }

    #[test]
    fn test_query_matches_accept_string() {
        let url = ConnectUrl::socket(2002);
        let query = ProcessQuery::for_url(&url);
        assert_eq!(query.command, "soffice");
        assert_eq!(query.argument, url.accept_string());
    }
}
