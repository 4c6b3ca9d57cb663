//! 本地分配表模块
//!
//! `LocalAllocations` 把地址池分配器和 "地址 -> 服务键" 映射表绑在一起，
//! 所有修改都成对地作用于两者，从而保持:
//! - 映射表是单射 (每个地址最多属于一个服务);
//! - 地址在映射表中当且仅当它在分配器中已分配
//!   (唯一的例外是 `allocate_ip` 与 `commit` 之间持久化状态的窗口)。

use crate::controller::components::address_allocator::AddressAllocator;
use crate::error::AllocatorError;
use crate::types::ServiceKey;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, error, trace};

/// `record_local_allocation` 的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// 分配已记录 (新记录或本来就存在)。
    Recorded,
    /// 服务必须重新分配地址，附带原因。
    Reallocate(String),
    /// 分配器返回了意外错误。重新分配无济于事，用同一地址重试也会重复该错误。
    Unexpected(AllocatorError),
}

/// 本地分配表。
pub struct LocalAllocations {
    allocator: Box<dyn AddressAllocator>,
    owners: HashMap<Ipv4Addr, ServiceKey>,
}

impl LocalAllocations {
    pub fn new(allocator: Box<dyn AddressAllocator>) -> Self {
        LocalAllocations {
            allocator,
            owners: HashMap::new(),
        }
    }

    /// 尝试为服务记录持久化状态中已有的地址。
    ///
    /// 同一地址已属于另一个服务时，先记录者胜出，当前服务需要重新分配。
    pub fn record_local_allocation(&mut self, key: &str, ip_string: &str) -> RecordOutcome {
        let ip: Ipv4Addr = match ip_string.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return RecordOutcome::Reallocate(format!(
                    "服务 {} 的 ingress 地址 {} 无效，将分配新地址",
                    key, ip_string
                ))
            }
        };

        match self.owners.get(&ip) {
            Some(owner) if owner == key => return RecordOutcome::Recorded,
            Some(_) => {
                return RecordOutcome::Reallocate(format!(
                    "另一个服务正在使用 ingress 地址 {}，将为 {} 分配新地址",
                    ip, key
                ))
            }
            None => {}
        }

        match self.allocator.allocate(ip) {
            Ok(()) => {}
            Err(AllocatorError::NotInRange { .. }) => {
                return RecordOutcome::Reallocate(format!(
                    "服务 {} 的 ingress 地址 {} 不在地址池 {} 中，将分配新地址",
                    key,
                    ip,
                    self.allocator.range_description()
                ))
            }
            // 映射表检查之后分配器不应再返回 AlreadyAllocated
            Err(e) => return RecordOutcome::Unexpected(e),
        }
        self.owners.insert(ip, key.to_string());
        debug!("(Allocations) 已记录服务 {} 的地址 {}", key, ip);
        RecordOutcome::Recorded
    }

    /// 如果地址当前属于给定服务，则释放它。
    ///
    /// 只释放属于该服务的地址，避免乱序到达的旧删除事件覆盖更新的分配。
    /// 返回是否确实释放了地址。
    pub fn clear_local_allocation(&mut self, key: &str, ip_string: &str) -> bool {
        trace!(
            "(Allocations) 尝试清除服务 {} 的本地地址 {}",
            key,
            ip_string
        );
        let ip: Ipv4Addr = match ip_string.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!("(Allocations) 无法解析地址 {}，无需释放", ip_string);
                return false;
            }
        };

        match self.owners.get(&ip) {
            None => {
                trace!("(Allocations) 地址 {} 当前未分配", ip);
                return false;
            }
            Some(owner) if owner != key => {
                trace!("(Allocations) 地址 {} 不属于服务 {}", ip, key);
                return false;
            }
            Some(_) => {}
        }

        if let Err(e) = self.allocator.release(ip) {
            error!(
                "(Allocations) 释放服务 {} 的地址 {} 失败 (本地状态不一致): {}",
                key, ip, e
            );
            return false;
        }
        self.owners.remove(&ip);
        debug!("(Allocations) 地址 {} 已可重新分配", ip);
        true
    }

    /// 分配一个地址: 优先使用请求的地址，不可用时分配下一个空闲地址。
    ///
    /// 返回的地址已在分配器中占用，但尚未写入映射表；
    /// 调用者必须随后调用 `commit` 或 `release_ip`。
    pub fn allocate_ip(&mut self, requested: Option<&str>) -> Result<Ipv4Addr, AllocatorError> {
        if let Some(ip) = requested.and_then(|s| s.parse::<Ipv4Addr>().ok()) {
            if !self.owners.contains_key(&ip) && self.allocator.allocate(ip).is_ok() {
                return Ok(ip);
            }
            debug!("(Allocations) 请求的地址 {} 不可用，改为分配下一个地址", ip);
        }
        self.allocator.allocate_next()
    }

    /// 回滚 `allocate_ip` 占用但未提交的地址。
    pub fn release_ip(&mut self, ip: Ipv4Addr) {
        if let Err(e) = self.allocator.release(ip) {
            error!("(Allocations) 回滚地址 {} 失败: {}", ip, e);
        }
    }

    /// 把 `allocate_ip` 得到的地址记入映射表。
    pub fn commit(&mut self, ip: Ipv4Addr, key: &str) {
        self.owners.insert(ip, key.to_string());
        debug!("(Allocations) 地址 {} 已分配给服务 {}", ip, key);
    }

    /// 地址的当前所有者。
    pub fn owner(&self, ip: Ipv4Addr) -> Option<&ServiceKey> {
        self.owners.get(&ip)
    }

    /// 映射表中的条目数。
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// 地址池剩余可分配的地址数。
    pub fn free(&self) -> usize {
        self.allocator.free()
    }

    /// 映射表与分配器是否一致: 条目数等于已分配数，且每个条目的地址都已分配。
    pub fn is_consistent(&self) -> bool {
        self.owners.len() == self.allocator.used()
            && self.owners.keys().all(|ip| self.allocator.has(*ip))
    }

    /// 当前所有分配的快照 (按地址排序)。
    pub fn snapshot(&self) -> Vec<(Ipv4Addr, ServiceKey)> {
        let mut entries: Vec<_> = self
            .owners
            .iter()
            .map(|(ip, key)| (*ip, key.clone()))
            .collect();
        entries.sort();
        entries
    }
}
