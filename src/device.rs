//! Raw packet sources/sinks the packet mutator runs on.
//!
//! A device hands out whole IPv4 packets one at a time and accepts whole
//! packets back. Creating the interface and routing traffic into it is the
//! operator's job; these types only attach to something that already exists.

use std::io;

/// Largest packet a device read can return.
pub const MAX_PACKET: usize = 65535;

pub trait CaptureDevice {
    fn read_packet(&mut self) -> io::Result<Vec<u8>>;
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use tun::TunDevice;

#[cfg(target_os = "linux")]
mod tun {
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};

    use super::{CaptureDevice, MAX_PACKET};

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct Ifreq {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// A TUN interface opened without packet info headers, so reads and
    /// writes are bare IP packets.
    pub struct TunDevice {
        fd: RawFd,
        buf: Vec<u8>,
    }

    impl TunDevice {
        pub fn attach(name: &str) -> io::Result<Self> {
            let name_bytes = name.as_bytes();
            if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid TUN interface name {:?}", name),
                ));
            }

            let fd = unsafe {
                libc::open(
                    b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                    libc::O_RDWR | libc::O_CLOEXEC,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut ifr = Ifreq {
                ifr_name: [0; libc::IFNAMSIZ],
                ifr_flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            for (i, &b) in name_bytes.iter().enumerate() {
                ifr.ifr_name[i] = b as libc::c_char;
            }

            if unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut ifr as *mut Ifreq) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            log::info!("Attached to TUN interface {}", name);
            Ok(Self {
                fd,
                buf: vec![0u8; MAX_PACKET],
            })
        }
    }

    impl CaptureDevice for TunDevice {
        fn read_packet(&mut self) -> io::Result<Vec<u8>> {
            let n = unsafe {
                libc::read(self.fd, self.buf.as_mut_ptr() as *mut libc::c_void, self.buf.len())
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(self.buf[..n as usize].to_vec())
        }

        fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
            let n = unsafe {
                libc::write(self.fd, packet.as_ptr() as *const libc::c_void, packet.len())
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n as usize != packet.len() {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write to TUN device"));
            }
            Ok(())
        }
    }

    impl AsRawFd for TunDevice {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    impl Drop for TunDevice {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Scripted device: reads come from `inbound`, writes are recorded.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryDevice {
    pub inbound: std::collections::VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
    pub fail_writes: bool,
}

#[cfg(test)]
impl CaptureDevice for MemoryDevice {
    fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        self.inbound
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more packets"))
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        self.written.push(packet.to_vec());
        Ok(())
    }
}
