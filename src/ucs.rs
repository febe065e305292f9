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

use crate::aggregate::{AggregateName, AggregateSource};
use crate::error::{Error, Result};
use crate::plugin::StatsTransport;
use crate::registry::CounterRegistry;
use crate::scanner::{ScanMode, ScanReport, StatsTree, TreeScanner};

use log::{debug, info, warn};

use std::borrow::Cow;
use std::ffi::CStr;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod shim {
    #![allow(non_camel_case_types)]

    pub const UCS_OK: ucs_status_t = 0;
    pub const UCS_STAT_NAME_MAX: usize = 31;
    pub const UCS_STATS_ACTIVE_CHILDREN: usize = 0;
    pub const UCS_STATS_CHILDREN_LAST: usize = 2;

    pub type ucs_status_t = i8;
    pub type ucs_stats_counter_t = u64;
    pub type ucs_stats_server_h = *mut libc::c_void;

    #[repr(C)]
    pub struct ucs_list_link_t {
        pub prev: *mut ucs_list_link_t,
        pub next: *mut ucs_list_link_t,
    }

    #[repr(C)]
    pub struct ucs_stats_class_t {
        pub name: *const libc::c_char,
        pub num_counters: libc::c_uint,
        pub counter_names: [*const libc::c_char; 0],
    }

    #[repr(C)]
    pub struct ucs_stats_node_t {
        pub cls: *mut ucs_stats_class_t,
        pub parent: *mut ucs_stats_node_t,
        pub name: [libc::c_char; UCS_STAT_NAME_MAX],
        pub list: ucs_list_link_t,
        pub children: [ucs_list_link_t; UCS_STATS_CHILDREN_LAST],
        pub counters: [ucs_stats_counter_t; 0],
    }

    #[repr(C)]
    pub struct ucs_stats_aggrgt_counter_name_t {
        pub class_name: *const libc::c_char,
        pub counter_name: *const libc::c_char,
    }

    pub type ServerStartFn =
        unsafe extern "C" fn(port: libc::c_int, p_server: *mut ucs_stats_server_h) -> ucs_status_t;
    pub type ServerDestroyFn = unsafe extern "C" fn(server: ucs_stats_server_h);
    pub type RcvdPacketsFn = unsafe extern "C" fn(server: ucs_stats_server_h) -> libc::c_ulong;
    pub type GetStatsFn = unsafe extern "C" fn(server: ucs_stats_server_h) -> *mut ucs_list_link_t;
    pub type PurgeStatsFn = unsafe extern "C" fn(server: ucs_stats_server_h);
    pub type DumpFn = unsafe extern "C" fn();
    pub type AggregateFn =
        unsafe extern "C" fn(counters: *mut ucs_stats_counter_t, size: libc::size_t) -> libc::size_t;
    pub type AggregateNamesFn = unsafe extern "C" fn(
        names: *mut *const ucs_stats_aggrgt_counter_name_t,
        size: *mut libc::size_t,
    );
}

pub const UCS_STATS_DEFAULT_UDP_PORT: u16 = 37873;

#[derive(Debug, Clone, Copy)]
struct Symbols {
    server_start: shim::ServerStartFn,
    server_destroy: shim::ServerDestroyFn,
    rcvd_packets: shim::RcvdPacketsFn,
    get_stats: shim::GetStatsFn,
    purge_stats: shim::PurgeStatsFn,
    dump: shim::DumpFn,
    aggregate: Option<shim::AggregateFn>,
    aggregate_names: Option<shim::AggregateNamesFn>,
}

/// UCX statistics library (`libucs`) loaded at runtime.
#[derive(Debug)]
pub struct UcsLibrary {
    _lib_handle: libloading::Library,
    symbols: Symbols,
}

impl UcsLibrary {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        // SAFETY: libucs is normally already mapped by the application; loading
        // it again only bumps its reference count
        unsafe {
            let lib = libloading::Library::new(path.as_ref().as_os_str())?;
            let symbols = Symbols {
                server_start: *lib.get::<shim::ServerStartFn>(b"ucs_stats_server_start\0")?,
                server_destroy: *lib.get::<shim::ServerDestroyFn>(b"ucs_stats_server_destroy\0")?,
                rcvd_packets: *lib.get::<shim::RcvdPacketsFn>(b"ucs_stats_server_rcvd_packets\0")?,
                get_stats: *lib.get::<shim::GetStatsFn>(b"ucs_stats_server_get_stats\0")?,
                purge_stats: *lib.get::<shim::PurgeStatsFn>(b"ucs_stats_server_purge_stats\0")?,
                dump: *lib.get::<shim::DumpFn>(b"ucs_stats_dump\0")?,
                // aggregate-sum is only present in some UCX builds
                aggregate: lib
                    .get::<shim::AggregateFn>(b"ucs_stats_aggregate\0")
                    .ok()
                    .map(|s| *s),
                aggregate_names: lib
                    .get::<shim::AggregateNamesFn>(b"ucs_stats_aggregate_get_counter_names\0")
                    .ok()
                    .map(|s| *s),
            };
            debug!(
                "Loaded {:?}, aggregate-sum {}",
                path.as_ref(),
                if symbols.aggregate.is_some() {
                    "available"
                } else {
                    "missing"
                }
            );
            Ok(Self {
                _lib_handle: lib,
                symbols,
            })
        }
    }

    pub fn has_aggregate(&self) -> bool {
        self.symbols.aggregate.is_some() && self.symbols.aggregate_names.is_some()
    }
}

/// UDP statistics server receiving the periodic dumps of UCX.
#[derive(Debug)]
pub struct StatsServer {
    lib: Arc<UcsLibrary>,
    port: u16,
    handle: Option<NonNull<libc::c_void>>,
    timeout: Option<Duration>,
}

/// # Safety
///
/// The server handle is only used from the thread holding the plugin lock.
unsafe impl Send for StatsServer {}

impl StatsServer {
    /// `timeout` bounds the wait for the first packets of a dump; `None`
    /// waits forever.
    pub fn new(lib: Arc<UcsLibrary>, port: u16, timeout: Option<Duration>) -> Self {
        Self {
            lib,
            port,
            handle: None,
            timeout,
        }
    }

    fn handle(&self) -> Result<shim::ucs_stats_server_h> {
        self.handle
            .map(NonNull::as_ptr)
            .ok_or(Error::Unavailable("UCX statistics server"))
    }

    fn wait_for_packets(&self, server: shim::ucs_stats_server_h) -> Result<()> {
        let start = Instant::now();
        // SAFETY: FFI calls on a live server handle
        unsafe {
            (self.lib.symbols.dump)();
            while (self.lib.symbols.rcvd_packets)(server) == 0 {
                if let Some(timeout) = self.timeout {
                    if start.elapsed() >= timeout {
                        return Err(Error::DiscoveryTimeout(timeout));
                    }
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }
}

impl StatsTransport for StatsServer {
    fn start_server(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut server = MaybeUninit::<shim::ucs_stats_server_h>::uninit();
        // SAFETY: FFI call writing the out-handle on success
        let status =
            unsafe { (self.lib.symbols.server_start)(self.port as _, server.as_mut_ptr()) };
        if status != shim::UCS_OK {
            warn!("ucs_stats_server_start() failed, status={}", status);
            return Err(Error::Unavailable("UCX statistics server"));
        }
        // SAFETY: initialized by a successful start
        self.handle = NonNull::new(unsafe { server.assume_init() });
        info!("UCX statistics server listening on port {}", self.port);
        Ok(())
    }

    fn scan(
        &mut self,
        scanner: &mut TreeScanner,
        registry: &mut CounterRegistry,
        mode: ScanMode,
    ) -> Result<ScanReport> {
        let server = self.handle()?;
        self.wait_for_packets(server)?;
        // SAFETY: the list returned by the server stays valid until purged
        let report = unsafe {
            let stats = (self.lib.symbols.get_stats)(server);
            let report = NodeTree::new(stats).map(|tree| scanner.scan(&tree, registry, mode));
            (self.lib.symbols.purge_stats)(server);
            report.unwrap_or_default()
        };
        Ok(report)
    }
}

impl std::ops::Drop for StatsServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // SAFETY: the handle came from a successful start
            unsafe { (self.lib.symbols.server_destroy)(handle.as_ptr()) };
        }
    }
}

/// Borrowed view of the node list received by the statistics server.
struct NodeTree<'a> {
    head: NonNull<shim::ucs_list_link_t>,
    _marker: PhantomData<&'a shim::ucs_list_link_t>,
}

#[derive(Debug, Clone, Copy)]
struct NodeRef(NonNull<shim::ucs_stats_node_t>);

impl NodeTree<'_> {
    /// # Safety
    ///
    /// `head` must be null or a valid list of stats nodes that outlives the view.
    unsafe fn new(head: *mut shim::ucs_list_link_t) -> Option<Self> {
        NonNull::new(head).map(|head| Self {
            head,
            _marker: PhantomData,
        })
    }

    /// Nodes linked through their `list` member, starting after `head`.
    fn list_nodes(head: *const shim::ucs_list_link_t) -> Vec<NodeRef> {
        let offset = std::mem::offset_of!(shim::ucs_stats_node_t, list);
        let mut nodes = Vec::new();
        // SAFETY: UCX keeps the lists circular and well formed while the
        // snapshot is alive
        unsafe {
            let mut link = (*head).next;
            while !link.is_null() && !std::ptr::eq(link, head) {
                let node = link.cast::<u8>().sub(offset).cast::<shim::ucs_stats_node_t>();
                if let Some(node) = NonNull::new(node) {
                    nodes.push(NodeRef(node));
                }
                link = (*link).next;
            }
        }
        nodes
    }

    fn class(node: NodeRef) -> *const shim::ucs_stats_class_t {
        // SAFETY: the node is part of the live snapshot
        unsafe { (*node.0.as_ptr()).cls }
    }
}

fn cstr_lossy<'a>(p: *const libc::c_char) -> Cow<'a, str> {
    if p.is_null() {
        return Cow::Borrowed("");
    }
    // SAFETY: UCX names are NUL-terminated static strings
    unsafe { CStr::from_ptr(p).to_string_lossy() }
}

impl StatsTree for NodeTree<'_> {
    type Node = NodeRef;

    fn roots(&self) -> Vec<NodeRef> {
        // each entry of the received list is one reporting context; its
        // active children are the top-level objects
        Self::list_nodes(self.head.as_ptr())
            .into_iter()
            .flat_map(|ctx| self.children_of(ctx))
            .collect()
    }

    fn children_of(&self, node: NodeRef) -> Vec<NodeRef> {
        // SAFETY: children lists are embedded in the live node
        let head = unsafe {
            std::ptr::addr_of!((*node.0.as_ptr()).children[shim::UCS_STATS_ACTIVE_CHILDREN])
        };
        Self::list_nodes(head)
    }

    fn label_of(&self, node: NodeRef) -> Cow<'_, str> {
        let cls = Self::class(node);
        if cls.is_null() {
            return Cow::Borrowed("");
        }
        // SAFETY: node classes are static data of libucs
        cstr_lossy(unsafe { (*cls).name })
    }

    fn leaf_counters_of(&self, node: NodeRef) -> Vec<(Cow<'_, str>, u64)> {
        let cls = Self::class(node);
        if cls.is_null() {
            return Vec::new();
        }
        // SAFETY: a node carries exactly `num_counters` counters and its class
        // exactly as many names, both laid out past the end of the struct
        unsafe {
            let n = (*cls).num_counters as usize;
            let names = std::ptr::addr_of!((*cls).counter_names).cast::<*const libc::c_char>();
            let values =
                std::ptr::addr_of!((*node.0.as_ptr()).counters).cast::<shim::ucs_stats_counter_t>();
            (0..n)
                .map(|k| (cstr_lossy(names.add(k).read()), values.add(k).read()))
                .collect()
        }
    }
}

/// Aggregate-sum counters computed inside UCX.
#[derive(Debug)]
pub struct UcsAggregate {
    _lib: Arc<UcsLibrary>,
    aggregate: shim::AggregateFn,
    aggregate_names: shim::AggregateNamesFn,
}

impl UcsAggregate {
    pub fn new(lib: Arc<UcsLibrary>) -> Result<Self> {
        match (lib.symbols.aggregate, lib.symbols.aggregate_names) {
            (Some(aggregate), Some(aggregate_names)) => Ok(Self {
                _lib: lib,
                aggregate,
                aggregate_names,
            }),
            _ => Err(Error::Unavailable("UCX aggregate-sum API")),
        }
    }
}

impl AggregateSource for UcsAggregate {
    fn aggregate(&mut self, counters: &mut [u64]) -> usize {
        // SAFETY: UCX writes at most `len` counters
        unsafe { (self.aggregate)(counters.as_mut_ptr(), counters.len()) }
    }

    fn counter_names(&mut self) -> Vec<AggregateName> {
        let mut names: *const shim::ucs_stats_aggrgt_counter_name_t = std::ptr::null();
        let mut size: libc::size_t = 0;
        // SAFETY: UCX returns a pointer to its own static name table
        unsafe {
            (self.aggregate_names)(&mut names, &mut size);
            if names.is_null() {
                return Vec::new();
            }
            std::slice::from_raw_parts(names, size)
                .iter()
                .map(|n| AggregateName {
                    class_name: cstr_lossy(n.class_name).into_owned(),
                    counter_name: cstr_lossy(n.counter_name).into_owned(),
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ptr::addr_of_mut;

    /// Builds a node by hand with the given class and counters stored
    /// right after it, the way UCX allocates them.
    #[repr(C)]
    struct NodeWithCounters<const N: usize> {
        node: shim::ucs_stats_node_t,
        counters: [u64; N],
    }

    #[repr(C)]
    struct ClassWithNames<const N: usize> {
        cls: shim::ucs_stats_class_t,
        names: [*const libc::c_char; N],
    }

    fn empty_link() -> shim::ucs_list_link_t {
        shim::ucs_list_link_t {
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        }
    }

    unsafe fn init_list(head: *mut shim::ucs_list_link_t) {
        (*head).prev = head;
        (*head).next = head;
    }

    unsafe fn push_back(head: *mut shim::ucs_list_link_t, link: *mut shim::ucs_list_link_t) {
        let last = (*head).prev;
        (*link).prev = last;
        (*link).next = head;
        (*last).next = link;
        (*head).prev = link;
    }

    fn node<const N: usize>(
        cls: *mut shim::ucs_stats_class_t,
        counters: [u64; N],
    ) -> Box<NodeWithCounters<N>> {
        let mut n = Box::new(NodeWithCounters {
            node: shim::ucs_stats_node_t {
                cls,
                parent: std::ptr::null_mut(),
                name: [0; shim::UCS_STAT_NAME_MAX],
                list: empty_link(),
                children: [empty_link(), empty_link()],
                counters: [],
            },
            counters,
        });
        unsafe {
            init_list(addr_of_mut!(n.node.children[0]));
            init_list(addr_of_mut!(n.node.children[1]));
        }
        n
    }

    #[test]
    fn walks_native_node_lists() {
        let mut ctx_cls = ClassWithNames::<0> {
            cls: shim::ucs_stats_class_t {
                name: c"ucs_context".as_ptr(),
                num_counters: 0,
                counter_names: [],
            },
            names: [],
        };
        let mut worker_cls = ClassWithNames::<2> {
            cls: shim::ucs_stats_class_t {
                name: c"ucp_worker".as_ptr(),
                num_counters: 2,
                counter_names: [],
            },
            names: [c"rndv".as_ptr(), c"eager".as_ptr()],
        };
        let mut ep_cls = ClassWithNames::<1> {
            cls: shim::ucs_stats_class_t {
                name: c"uct_ep".as_ptr(),
                num_counters: 1,
                counter_names: [],
            },
            names: [c"bytes_short".as_ptr()],
        };

        let mut head = empty_link();
        let mut ctx = node(addr_of_mut!(ctx_cls.cls), []);
        let mut worker = node(addr_of_mut!(worker_cls.cls), [11, 12]);
        let mut ep = node(addr_of_mut!(ep_cls.cls), [13]);

        unsafe {
            init_list(&mut head);
            push_back(&mut head, addr_of_mut!(ctx.node.list));
            push_back(
                addr_of_mut!(ctx.node.children[0]),
                addr_of_mut!(worker.node.list),
            );
            push_back(
                addr_of_mut!(worker.node.children[0]),
                addr_of_mut!(ep.node.list),
            );

            let tree = NodeTree::new(&mut head).unwrap();
            let mut registry = CounterRegistry::new();
            let report = TreeScanner::new().scan(&tree, &mut registry, ScanMode::Discover);

            assert_eq!(report.nodes_visited, 2);
            let got: Vec<(String, u64)> = registry
                .iter()
                .map(|e| (e.name.clone(), e.value))
                .collect();
            assert_eq!(
                got,
                vec![
                    ("cnt-object-0-ucp_worker-rndv".to_owned(), 11),
                    ("cnt-object-0-ucp_worker-eager".to_owned(), 12),
                    ("cnt-object-1-ucp_worker-uct_ep-bytes_short".to_owned(), 13),
                ]
            );
        }
    }

    #[test]
    fn missing_library_is_an_error() {
        assert!(UcsLibrary::from_path("/nonexistent/libucs.so").is_err());
    }
}
