use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::ptr;

use log::debug;

use crate::error::{LogPingsError, Result};
use crate::socket::{Datagrams, RawSocket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Account {
    pub fn lookup(name: &str) -> Result<Self> {
        let unknown = || LogPingsError::UnknownUser(name.to_string());
        let c_name = CString::new(name).map_err(|_| unknown())?;

        let mut pwd: libc::passwd = unsafe { mem::zeroed() };
        let mut result: *mut libc::passwd = ptr::null_mut();
        let mut buf: Vec<libc::c_char> = vec![0; 1024];
        let rc = loop {
            let rc = unsafe {
                libc::getpwnam_r(c_name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
            };
            if rc == libc::ERANGE && buf.len() < 1 << 20 {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            break rc;
        };

        if rc != 0 {
            return Err(LogPingsError::Harden {
                call: "getpwnam_r",
                source: io::Error::from_raw_os_error(rc),
            });
        }
        if result.is_null() {
            return Err(unknown());
        }
        Ok(Account { name: name.to_string(), uid: pwd.pw_uid, gid: pwd.pw_gid })
    }
}

/// Where to chroot and whom to become once the socket is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hardening {
    pub chroot: PathBuf,
    pub account: Account,
}

impl Hardening {
    /// Check directory and account up front, while /etc/passwd is still
    /// visible and before anything is bound.
    pub fn prepare(chroot: &Path, user: &str) -> Result<Self> {
        if !chroot.is_dir() {
            return Err(LogPingsError::NotADirectory(chroot.to_path_buf()));
        }
        let account = Account::lookup(user)?;
        Ok(Hardening { chroot: chroot.to_path_buf(), account })
    }
}

/// The OS calls the service needs, in the order it needs them.
pub trait Platform {
    type Socket: Datagrams;

    fn bind(&mut self, address: Ipv4Addr) -> io::Result<Self::Socket>;
    fn chroot(&mut self, dir: &Path) -> io::Result<()>;
    fn setgid(&mut self, gid: libc::gid_t) -> io::Result<()>;
    fn clear_groups(&mut self) -> io::Result<()>;
    fn setuid(&mut self, uid: libc::uid_t) -> io::Result<()>;
}

pub struct Os;

fn cvt(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Platform for Os {
    type Socket = RawSocket;

    fn bind(&mut self, address: Ipv4Addr) -> io::Result<RawSocket> {
        RawSocket::bind(address)
    }

    fn chroot(&mut self, dir: &Path) -> io::Result<()> {
        std::os::unix::fs::chroot(dir)?;
        std::env::set_current_dir("/")
    }

    fn setgid(&mut self, gid: libc::gid_t) -> io::Result<()> {
        cvt(unsafe { libc::setgid(gid) })
    }

    fn clear_groups(&mut self) -> io::Result<()> {
        cvt(unsafe { libc::setgroups(0, ptr::null()) })
    }

    fn setuid(&mut self, uid: libc::uid_t) -> io::Result<()> {
        cvt(unsafe { libc::setuid(uid) })
    }
}

/// chroot, then group, then user. Dropping the user last keeps the
/// privilege needed for the earlier calls.
pub fn drop_privileges<P: Platform>(platform: &mut P, plan: &Hardening) -> Result<()> {
    let harden = |call: &'static str| move |source: io::Error| LogPingsError::Harden { call, source };

    debug!("os.chroot({:?})", plan.chroot);
    platform.chroot(&plan.chroot).map_err(harden("chroot"))?;

    debug!("os.setuid({:?})", plan.account.name);
    platform.setgid(plan.account.gid).map_err(harden("setgid"))?;
    platform.clear_groups().map_err(harden("setgroups"))?;
    platform.setuid(plan.account.uid).map_err(harden("setuid"))?;
    Ok(())
}
