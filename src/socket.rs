use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;

use log::debug;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Makes a blocked [`Datagrams::recv`] return.
pub type Waker = Box<dyn Fn() + Send>;

/// Source of raw IP datagrams.
pub trait Datagrams {
    /// Receive one datagram into `buf` and return its full length, which is
    /// larger than `buf.len()` when the datagram did not fit.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn waker(&self) -> Waker {
        Box::new(|| {})
    }
}

/// Raw IPv4 socket receiving every ICMP datagram addressed to the host.
pub struct RawSocket {
    socket: Arc<Socket>,
}

impl RawSocket {
    pub fn bind(address: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.bind(&SockAddr::from(SocketAddr::from((address, 0))))?;
        Ok(RawSocket { socket: Arc::new(socket) })
    }
}

impl Datagrams for RawSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the buffer is initialised and recv only writes bytes into it.
        let buf = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        // MSG_TRUNC makes the kernel report the real length of longer datagrams
        self.socket.recv_with_flags(buf, libc::MSG_TRUNC)
    }

    fn waker(&self) -> Waker {
        let socket = Arc::downgrade(&self.socket);
        Box::new(move || {
            if let Some(socket) = socket.upgrade() {
                // Reports ENOTCONN for an unconnected socket, but still wakes
                // up the pending recv.
                let _ = socket.shutdown(Shutdown::Read);
            }
        })
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        debug!("socket.close()");
    }
}
