//! Stand-in for a new server binary: takes over a TCP and a unix listener, answers one
//! connection on each with its pid, then shuts down for good.

use std::{env, error::Error, io::Write, process};

use moult::{Options, Upgrader};

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().skip(1);
    let (Some(tcp), Some(unix)) = (args.next(), args.next()) else {
        return Err("usage: echo_child <tcp address> <unix path>".into());
    };

    let upgrader = Upgrader::new(Options::new())?;
    let tcp_listener = upgrader
        .fds()
        .listen("tcp", &tcp)?
        .into_tcp()
        .ok_or("not a tcp listener")?;
    let unix_listener = upgrader
        .fds()
        .listen("unix", &unix)?
        .into_unix()
        .ok_or("not a unix listener")?;
    // The parent may have left the sockets non-blocking.
    tcp_listener.set_nonblocking(false)?;
    unix_listener.set_nonblocking(false)?;
    upgrader.ready()?;

    let (mut stream, _) = tcp_listener.accept()?;
    write!(stream, "{}", process::id())?;
    drop(stream);
    let (mut stream, _) = unix_listener.accept()?;
    write!(stream, "{}", process::id())?;
    drop(stream);

    upgrader.stop();
    Ok(())
}
