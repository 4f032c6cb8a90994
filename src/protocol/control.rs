//! Manager-plane messages: requests the manager parses, and the descriptor
//! strings it hands back so clients can reach the storage nodes directly.
//!
//! Replies are `SUCCESS`, `SUCCESS\n<lines>`, `FAILURE[: <reason>]`, or one
//! of three descriptor shapes:
//!
//! - copy / decommission: `<dss> <n> <S> <disk1> <ip1> <cport1> ...`
//! - read: `<size> <dss> <n> <S> <disk1> <ip1> <cport1> ...`
//! - disk-failure: the copy shape followed by the stored file names

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

use snafu::{OptionExt, Snafu};

use crate::raid::Geometry;

pub const SUCCESS: &str = "SUCCESS";
pub const FAILURE: &str = "FAILURE";

pub fn failure(reason: impl std::fmt::Display) -> String {
    format!("{FAILURE}: {reason}")
}

pub fn is_success(reply: &str) -> bool {
    reply.starts_with(SUCCESS)
}

pub fn is_failure(reply: &str) -> bool {
    reply.starts_with(FAILURE)
}

#[derive(Debug, Snafu)]
pub enum RequestParseError {
    #[snafu(display("empty request"))]
    EmptyRequest,

    #[snafu(display("unknown command {verb:?}"))]
    UnknownVerb { verb: String },

    #[snafu(display("{verb} takes {expected} arguments, got {got}"))]
    WrongArgCount {
        verb: &'static str,
        expected: usize,
        got: usize,
    },

    #[snafu(display("invalid IP address {value:?}"))]
    BadIp { value: String },

    #[snafu(display("invalid port {value:?}"))]
    BadPort { value: String },

    #[snafu(display("invalid {field} {value:?}"))]
    BadNumber {
        field: &'static str,
        value: String,
    },
}

/// Every verb the manager understands, one datagram each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterUser {
        name: String,
        ip: IpAddr,
        mport: u16,
        cport: u16,
    },
    RegisterDisk {
        name: String,
        ip: IpAddr,
        mport: u16,
        cport: u16,
    },
    DeregisterUser { name: String },
    DeregisterDisk { name: String },
    ConfigureDss {
        name: String,
        drives: usize,
        unit: usize,
    },
    Ls,
    Copy {
        file: String,
        size: u64,
        owner: String,
    },
    CopyComplete,
    Read { user: String, file: String },
    DiskFailure { dss: String },
    RecoveryComplete,
    DecommissionDss { name: String },
    DecommissionComplete,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, RequestParseError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().context(EmptyRequestSnafu)?;
        let args: Vec<&str> = tokens.collect();

        match verb {
            "register-user" => {
                expect_args("register-user", &args, 4)?;
                Ok(Request::RegisterUser {
                    name: args[0].to_string(),
                    ip: parse_ip(args[1])?,
                    mport: parse_port(args[2])?,
                    cport: parse_port(args[3])?,
                })
            }
            "register-disk" => {
                expect_args("register-disk", &args, 4)?;
                Ok(Request::RegisterDisk {
                    name: args[0].to_string(),
                    ip: parse_ip(args[1])?,
                    mport: parse_port(args[2])?,
                    cport: parse_port(args[3])?,
                })
            }
            "deregister-user" => {
                expect_args("deregister-user", &args, 1)?;
                Ok(Request::DeregisterUser {
                    name: args[0].to_string(),
                })
            }
            "deregister-disk" => {
                expect_args("deregister-disk", &args, 1)?;
                Ok(Request::DeregisterDisk {
                    name: args[0].to_string(),
                })
            }
            "configure-dss" => {
                expect_args("configure-dss", &args, 3)?;
                Ok(Request::ConfigureDss {
                    name: args[0].to_string(),
                    drives: parse_number("drive count", args[1])?,
                    unit: parse_number("striping unit", args[2])?,
                })
            }
            "ls" => {
                expect_args("ls", &args, 0)?;
                Ok(Request::Ls)
            }
            "copy" => {
                expect_args("copy", &args, 3)?;
                Ok(Request::Copy {
                    file: args[0].to_string(),
                    size: parse_number("file size", args[1])?,
                    owner: args[2].to_string(),
                })
            }
            "copy-complete" => {
                expect_args("copy-complete", &args, 0)?;
                Ok(Request::CopyComplete)
            }
            "read" => {
                expect_args("read", &args, 2)?;
                Ok(Request::Read {
                    user: args[0].to_string(),
                    file: args[1].to_string(),
                })
            }
            "disk-failure" => {
                expect_args("disk-failure", &args, 1)?;
                Ok(Request::DiskFailure {
                    dss: args[0].to_string(),
                })
            }
            "recovery-complete" => {
                expect_args("recovery-complete", &args, 0)?;
                Ok(Request::RecoveryComplete)
            }
            "decommission-dss" => {
                expect_args("decommission-dss", &args, 1)?;
                Ok(Request::DecommissionDss {
                    name: args[0].to_string(),
                })
            }
            "decommission-complete" => {
                expect_args("decommission-complete", &args, 0)?;
                Ok(Request::DecommissionComplete)
            }
            other => Err(RequestParseError::UnknownVerb {
                verb: other.to_string(),
            }),
        }
    }
}

fn expect_args(
    verb: &'static str,
    args: &[&str],
    expected: usize,
) -> Result<(), RequestParseError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(RequestParseError::WrongArgCount {
            verb,
            expected,
            got: args.len(),
        })
    }
}

fn parse_ip(value: &str) -> Result<IpAddr, RequestParseError> {
    value.parse().ok().context(BadIpSnafu { value })
}

fn parse_port(value: &str) -> Result<u16, RequestParseError> {
    value.parse().ok().context(BadPortSnafu { value })
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, RequestParseError> {
    value.parse().ok().context(BadNumberSnafu { field, value })
}

#[derive(Debug, Snafu)]
pub enum DescriptorError {
    #[snafu(display("descriptor is missing its {field} field"))]
    Truncated { field: &'static str },

    #[snafu(display("descriptor carries a bad {field}: {value:?}"))]
    BadField {
        field: &'static str,
        value: String,
    },

    #[snafu(display("descriptor has trailing tokens"))]
    Trailing,
}

/// One storage node as the client reaches it: name plus peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAddr {
    pub name: String,
    pub addr: SocketAddr,
}

/// The client's view of a DSS, parsed from a manager descriptor. The disk
/// order is the drive order; it drives parity placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DssView {
    pub name: String,
    pub unit: usize,
    pub disks: Vec<DiskAddr>,
}

impl DssView {
    pub fn geometry(&self) -> Geometry {
        Geometry {
            drives: self.disks.len(),
            unit: self.unit,
        }
    }

    /// The copy / decommission descriptor shape.
    pub fn descriptor(&self) -> String {
        let mut out = format!("{} {} {}", self.name, self.disks.len(), self.unit);
        for disk in &self.disks {
            let _ = write!(out, " {} {} {}", disk.name, disk.addr.ip(), disk.addr.port());
        }
        out
    }

    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut tokens = descriptor.split_whitespace();
        let view = parse_view(&mut tokens)?;
        if tokens.next().is_some() {
            return Err(DescriptorError::Trailing);
        }
        Ok(view)
    }
}

/// `<size> <dss> <n> <S> <disks...>`, replied to `read`.
pub fn format_read_descriptor(size: u64, view: &DssView) -> String {
    format!("{size} {}", view.descriptor())
}

pub fn parse_read_descriptor(descriptor: &str) -> Result<(u64, DssView), DescriptorError> {
    let mut tokens = descriptor.split_whitespace();
    let size = parse_field("file size", tokens.next())?;
    let view = parse_view(&mut tokens)?;
    if tokens.next().is_some() {
        return Err(DescriptorError::Trailing);
    }
    Ok((size, view))
}

/// The copy shape followed by the DSS's stored file names, replied to
/// `disk-failure`.
pub fn format_repair_descriptor(view: &DssView, files: &[String]) -> String {
    let mut out = view.descriptor();
    for file in files {
        let _ = write!(out, " {file}");
    }
    out
}

pub fn parse_repair_descriptor(
    descriptor: &str,
) -> Result<(DssView, Vec<String>), DescriptorError> {
    let mut tokens = descriptor.split_whitespace();
    let view = parse_view(&mut tokens)?;
    let files = tokens.map(str::to_string).collect();
    Ok((view, files))
}

fn parse_view<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<DssView, DescriptorError> {
    let name = tokens
        .next()
        .context(TruncatedSnafu { field: "dss name" })?
        .to_string();
    let drives: usize = parse_field("drive count", tokens.next())?;
    let unit: usize = parse_field("striping unit", tokens.next())?;

    let mut disks = Vec::with_capacity(drives);
    for _ in 0..drives {
        let disk = tokens
            .next()
            .context(TruncatedSnafu { field: "disk name" })?
            .to_string();
        let ip: IpAddr = parse_field("disk ip", tokens.next())?;
        let port: u16 = parse_field("disk port", tokens.next())?;
        disks.push(DiskAddr {
            name: disk,
            addr: SocketAddr::new(ip, port),
        });
    }

    Ok(DssView { name, unit, disks })
}

fn parse_field<T: std::str::FromStr>(
    field: &'static str,
    token: Option<&str>,
) -> Result<T, DescriptorError> {
    let token = token.context(TruncatedSnafu { field })?;
    token.parse().ok().context(BadFieldSnafu {
        field,
        value: token,
    })
}
