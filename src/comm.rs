//! NDJSON control channel.
//!
//! External callers send one JSON command per line and get one JSON reply
//! per line. Every command maps onto one engine accessor. A malformed line
//! gets an error reply and the channel keeps going.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

use crate::alert::{AlertDispatcher, NotificationTransport};
use crate::engine::{dispatch_alert, Engine};
use crate::filter::{TargetEntry, TargetError};
use crate::protocol::{AddressError, BdAddress, HostCommand, HostReply, LocationError, ReplyBody};

/// Longest accepted command line in bytes.
pub const MAX_COMMAND_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command longer than {} bytes", MAX_COMMAND_LEN)]
    TooLong,
    #[error("malformed command: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Location(#[from] LocationError),
}

/// Parse one command line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<HostCommand>, CommandError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_COMMAND_LEN {
        return Err(CommandError::TooLong);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

/// Apply a command to the engine and build the reply.
pub fn handle_command<T: NotificationTransport>(
    cmd: HostCommand,
    engine: &Engine,
    dispatcher: &AlertDispatcher<T>,
) -> Result<HostReply, CommandError> {
    let reply = match cmd {
        HostCommand::ListDevices => HostReply::ok(ReplyBody::Devices {
            devices: engine.list_devices(),
        }),
        HostCommand::ListLogs => HostReply::ok(ReplyBody::Logs {
            logs: engine.list_logs(),
        }),
        HostCommand::ListTargets => HostReply::ok(ReplyBody::Targets {
            targets: engine.list_targets(),
        }),
        HostCommand::Status => HostReply::ok(ReplyBody::Status {
            status: engine.status(),
        }),
        HostCommand::Clear => {
            engine.clear();
            HostReply::done()
        }
        HostCommand::AddTarget {
            bd_address,
            name,
            manufacturer,
        } => {
            let target = TargetEntry::new(
                &bd_address,
                name.as_deref().unwrap_or(""),
                manufacturer.as_deref().unwrap_or(""),
            )?;
            engine.add_target(target);
            HostReply::done()
        }
        HostCommand::SetLocation { lat, lng, accuracy } => {
            engine.set_observer_location(lat, lng, accuracy)?;
            HostReply::done()
        }
        HostCommand::Start => {
            engine.set_running(true);
            HostReply::done()
        }
        HostCommand::Stop => {
            engine.set_running(false);
            HostReply::done()
        }
        HostCommand::SimulateAlert {
            bd_address,
            location,
        } => {
            let bd_address: BdAddress = bd_address.parse()?;
            let location = location.map(|loc| loc.validated()).transpose()?;
            let alert = engine.manual_alert(bd_address, location);
            dispatch_alert(engine, dispatcher, &alert);
            HostReply::done()
        }
    };
    Ok(reply)
}

/// Handle one raw line. `None` for blank lines, which get no reply.
pub fn handle_line<T: NotificationTransport>(
    line: &str,
    engine: &Engine,
    dispatcher: &AlertDispatcher<T>,
) -> Option<HostReply> {
    let result = parse_command(line)
        .and_then(|cmd| cmd.map(|cmd| handle_command(cmd, engine, dispatcher)).transpose());
    match result {
        Ok(reply) => reply,
        Err(err) => Some(HostReply::error(err)),
    }
}

/// Serialize a reply as one NDJSON line.
pub fn serialize_reply(reply: &HostReply) -> String {
    match serde_json::to_string(reply) {
        Ok(mut json) => {
            json.push('\n');
            json
        }
        Err(err) => {
            log::error!("Reply serialization failed: {}", err);
            "{\"ok\":false,\"error\":\"reply serialization failed\"}\n".to_string()
        }
    }
}

/// Serve commands from `input` until EOF, writing replies to `output`.
///
/// At most `MAX_COMMAND_LEN + 1` bytes of a line are buffered. The rest of an
/// oversized line is discarded and answered with one error reply.
pub fn serve<R, W, T>(
    mut input: R,
    mut output: W,
    engine: &Engine,
    dispatcher: &AlertDispatcher<T>,
) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    T: NotificationTransport,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = input
            .by_ref()
            .take(MAX_COMMAND_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(());
        }

        let reply = if buf.len() > MAX_COMMAND_LEN && buf.last() != Some(&b'\n') {
            discard_line(&mut input)?;
            Some(HostReply::error(CommandError::TooLong))
        } else {
            match std::str::from_utf8(&buf) {
                Ok(line) => handle_line(line, engine, dispatcher),
                Err(_) => Some(HostReply::error("command is not UTF-8")),
            }
        };
        if let Some(reply) = reply {
            output.write_all(serialize_reply(&reply).as_bytes())?;
            output.flush()?;
        }
    }
}

/// Skip input up to and including the next newline, or to EOF.
fn discard_line<R: BufRead>(input: &mut R) -> io::Result<()> {
    loop {
        let (found, used) = {
            let available = input.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        input.consume(used);
        if found {
            return Ok(());
        }
    }
}
