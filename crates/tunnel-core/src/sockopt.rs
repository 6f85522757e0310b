use std::net::TcpStream;

/// Enables `SO_KEEPALIVE` on a freshly accepted public-listener connection,
/// matching the original server's socket setup. `std::net::TcpStream` has
/// no safe accessor for this option, so it's set directly via `libc` on the
/// raw file descriptor, the way the teacher's networking code reaches for
/// `libc::setsockopt` rather than hand-rolling a syscall wrapper.
#[cfg(unix)]
pub fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(enable).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_keepalive(_stream: &TcpStream) -> std::io::Result<()> {
    Ok(())
}
