// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// NIC statistics through the ethtool ioctl (`ethtool -S`).

use crate::error::Result;
use crate::nic::NicDevice;

use log::debug;
use static_assertions::const_assert_eq;

use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GSTRINGS: u32 = 0x1b;
const ETHTOOL_GSTATS: u32 = 0x1d;
const ETHTOOL_GSSET_INFO: u32 = 0x37;
const ETH_SS_STATS: u32 = 1;

pub const ETH_GSTRING_LEN: usize = 32;

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
    _pad: [u8; 16],
}

#[cfg(target_pointer_width = "64")]
const_assert_eq!(std::mem::size_of::<Ifreq>(), 40);

#[repr(C)]
struct SsetInfo {
    cmd: u32,
    reserved: u32,
    sset_mask: u64,
    data: u32,
}

/// Counter snapshot of one network interface.
#[derive(Debug)]
pub struct EthtoolDevice {
    ifname: String,
    socket: OwnedFd,
    names: Vec<String>,
    values: Vec<u64>,
}

impl EthtoolDevice {
    pub fn open(ifname: &str) -> Result<Self> {
        if ifname.is_empty() || ifname.len() >= libc::IFNAMSIZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid interface name {:?}", ifname),
            )
            .into());
        }
        // SAFETY: plain socket(2) call; the descriptor is owned right away
        let socket = unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            OwnedFd::from_raw_fd(fd)
        };
        let mut dev = Self {
            ifname: ifname.to_owned(),
            socket,
            names: Vec::new(),
            values: Vec::new(),
        };
        let n = dev.stats_count()?;
        dev.read_names(n)?;
        debug!("Opened NIC {} with {} counters", dev.ifname, n);
        Ok(dev)
    }

    fn ioctl(&self, data: *mut libc::c_void) -> std::io::Result<()> {
        let mut ifr = Ifreq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_data: data,
            _pad: [0; 16],
        };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(self.ifname.bytes()) {
            *dst = src as libc::c_char;
        }
        // SAFETY: `ifr` and the buffer behind `data` outlive the call
        let r = unsafe {
            libc::ioctl(
                self.socket.as_raw_fd(),
                SIOCETHTOOL as _,
                &mut ifr as *mut Ifreq,
            )
        };
        if r < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn stats_count(&self) -> std::io::Result<usize> {
        let mut info = SsetInfo {
            cmd: ETHTOOL_GSSET_INFO,
            reserved: 0,
            sset_mask: 1 << ETH_SS_STATS,
            data: 0,
        };
        self.ioctl(&mut info as *mut SsetInfo as *mut _)?;
        if info.sset_mask & (1 << ETH_SS_STATS) == 0 {
            return Ok(0);
        }
        Ok(info.data as usize)
    }

    fn read_names(&mut self, n: usize) -> std::io::Result<()> {
        // header: cmd, string_set, len; then n fixed-size strings
        let mut buf = vec![0u32; 3 + n * ETH_GSTRING_LEN / 4];
        buf[0] = ETHTOOL_GSTRINGS;
        buf[1] = ETH_SS_STATS;
        buf[2] = n as u32;
        self.ioctl(buf.as_mut_ptr().cast())?;

        let len = (buf[2] as usize).min(n);
        // SAFETY: the buffer holds 12 + n * ETH_GSTRING_LEN initialized bytes
        let bytes = unsafe {
            std::slice::from_raw_parts(
                buf.as_ptr().cast::<u8>().add(12),
                n * ETH_GSTRING_LEN,
            )
        };
        self.names = bytes
            .chunks_exact(ETH_GSTRING_LEN)
            .take(len)
            .map(|raw| {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..end]).into_owned()
            })
            .collect();
        Ok(())
    }

    fn read_values(&mut self, n: usize) -> std::io::Result<()> {
        // header: cmd, n_stats (two u32 in the first u64); then n u64 values
        let mut buf = vec![0u64; 1 + n];
        // SAFETY: the first 8 bytes are the two header words
        unsafe {
            let hdr = buf.as_mut_ptr().cast::<u32>();
            *hdr = ETHTOOL_GSTATS;
            *hdr.add(1) = n as u32;
        }
        self.ioctl(buf.as_mut_ptr().cast())?;
        self.values.clear();
        self.values.extend_from_slice(&buf[1..]);
        Ok(())
    }
}

impl NicDevice for EthtoolDevice {
    fn query(&mut self) -> Result<usize> {
        let n = self.stats_count()?;
        if n != self.names.len() {
            self.read_names(n)?;
        }
        self.read_values(n)?;
        Ok(n)
    }

    fn counter_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    fn counter_value(&self, index: usize) -> u64 {
        self.values.get(index).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_interface_names() {
        assert!(EthtoolDevice::open("").is_err());
        assert!(EthtoolDevice::open("an_interface_name_too_long").is_err());
    }

    #[test]
    fn loopback_has_no_driver_stats() {
        // lo has no ethtool driver stats; opening may fail or expose zero counters
        if let Ok(mut dev) = EthtoolDevice::open("lo") {
            let n = dev.query().unwrap_or(0);
            assert_eq!(dev.counter_value(n), 0);
            assert_eq!(dev.counter_name(n), None);
        }
    }
}
