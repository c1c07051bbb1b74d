//! TUN device ownership and plumbing.
//!
//! The device is opened in `IFF_TUN | IFF_NO_PI` mode: reads and writes on
//! the fd exchange whole IP packets with no link-layer or protocol prefix.
//! Address, MTU and link state are configured out-of-band through the host
//! `ip` utility, matching what operators would type by hand.

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Command;

const IFNAMSIZ: usize = 16;

fn pack_ifname(name: &str) -> io::Result<[libc::c_char; IFNAMSIZ]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name must be 1-15 bytes with no NUL",
        ));
    }
    let mut packed = [0 as libc::c_char; IFNAMSIZ];
    for (dst, &src) in packed.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }
    Ok(packed)
}

pub struct TunDevice {
    fd: OwnedFd,
    name: String,
    index: u32,
    mtu: u32,
}

impl TunDevice {
    /// Open `/dev/net/tun` and attach to `name`. Templates such as `tun%d`
    /// are expanded by the kernel; the resolved name is read back.
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        ifr.ifr_name = pack_ifname(name)?;
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: fd is a freshly opened tun control fd and ifr is a valid
        // ifreq for the TUNSETIFF request.
        if unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the kernel NUL-terminates the resolved name in ifr_name.
        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let cname = std::ffi::CString::new(name.clone()).expect("resolved ifname has no NUL");
        // SAFETY: cname is a valid NUL-terminated interface name.
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: file.into(),
            name,
            index,
            mtu: 1500,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// `ip addr add CIDR dev NAME`
    pub fn set_cidr(&self, cidr: &str) -> io::Result<()> {
        run_ip(&["addr", "add", cidr, "dev", &self.name])
    }

    /// `ip link set dev NAME mtu MTU`
    pub fn set_mtu(&mut self, mtu: u32) -> io::Result<()> {
        run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])?;
        self.mtu = mtu;
        Ok(())
    }

    /// `ip link set dev NAME up`
    pub fn set_up(&self) -> io::Result<()> {
        run_ip(&["link", "set", "dev", &self.name, "up"])
    }
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::other(format!(
            "ip {} exited with {}",
            args.join(" "),
            status
        )));
    }
    Ok(())
}
