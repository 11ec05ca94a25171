//! The single Unix-socket handshake handing the FUSE file descriptor,
//! argument vector, and environment to a Mountpoint Pod, per the wire
//! format in spec §6: one length-prefixed message, one attached fd via
//! `SCM_RIGHTS`, and a single response byte (or a `mount.error` sentinel).

use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DriverError;

const SUCCESS_BYTE: u8 = 0x00;
const CMSG_BUF_LEN: usize = 64;

fn write_length_prefixed(buf: &mut Vec<u8>, items: &[String]) {
    buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        buf.extend_from_slice(&(item.len() as u32).to_be_bytes());
        buf.extend_from_slice(item.as_bytes());
    }
}

/// Connects to the Mountpoint Pod's socket, sends the framed handshake
/// message with the FUSE fd attached, and waits up to `deadline` for the
/// success byte. The blocking socket I/O runs on a dedicated thread since
/// there is exactly one round-trip per publish.
pub async fn perform(
    socket_path: &Path,
    bucket_name: &str,
    argv: Vec<String>,
    env: Vec<String>,
    credentials_dir: &str,
    fuse_fd: RawFd,
    deadline: Duration,
) -> Result<(), DriverError> {
    let socket_path: PathBuf = socket_path.to_path_buf();
    let bucket_name = bucket_name.to_owned();
    let credentials_dir = credentials_dir.to_owned();
    let pod_label = socket_path.display().to_string();

    let outcome = tokio::time::timeout(
        deadline,
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let stream = UnixStream::connect(&socket_path).map_err(|e| e.to_string())?;

            let mut message = Vec::new();
            message.extend_from_slice(&(bucket_name.len() as u32).to_be_bytes());
            message.extend_from_slice(bucket_name.as_bytes());
            write_length_prefixed(&mut message, &argv);
            write_length_prefixed(&mut message, &env);
            message.extend_from_slice(&(credentials_dir.len() as u32).to_be_bytes());
            message.extend_from_slice(credentials_dir.as_bytes());

            send_with_fd(&stream, &message, fuse_fd).map_err(|e| e.to_string())?;

            let mut response = [0u8; 1];
            (&stream)
                .read_exact(&mut response)
                .map_err(|e| e.to_string())?;
            if response[0] != SUCCESS_BYTE {
                return Err(format!(
                    "mountpoint pod rejected handshake, response byte {:#x}",
                    response[0]
                ));
            }
            Ok(())
        }),
    )
    .await;

    match outcome {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(detail))) => Err(DriverError::MountpointHandshake {
            pod_name: pod_label,
            detail,
        }),
        Ok(Err(join_err)) => Err(DriverError::MountpointHandshake {
            pod_name: pod_label,
            detail: join_err.to_string(),
        }),
        Err(_) => Err(DriverError::MountpointHandshake {
            pod_name: pod_label,
            detail: "timed out waiting for handshake response".to_owned(),
        }),
    }
}

/// Sends `payload` over `stream` with one attached file descriptor via
/// `SCM_RIGHTS`. Uses raw `libc::sendmsg` since none of the teacher's or
/// pack's dependencies ships a ready-made ancillary-data helper.
fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> std::io::Result<()> {
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_encoding_round_trips_lengths() {
        let mut buf = Vec::new();
        write_length_prefixed(&mut buf, &["--allow-root".to_owned(), "--gid=1000".to_owned()]);
        assert_eq!(&buf[0..4], &2u32.to_be_bytes());
        let first_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        assert_eq!(first_len, "--allow-root".len());
    }
}
