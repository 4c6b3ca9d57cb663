//! 地址池分配器模块
//! 定义了地址池 (`IngressRange`)、分配器 Trait (`AddressAllocator`) 及其基于位图的默认实现。

use crate::error::{AllocatorError, RangeError};
use fixedbitset::FixedBitSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// 一段连续的、可分配的 IPv4 地址。
///
/// 从 CIDR 构造时，网络地址和广播地址不参与分配，
/// 所以 `/30` 只提供两个可用地址，`/31` 和 `/32` 为空池。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRange {
    /// 第一个可分配地址。
    first: u32,
    /// 可分配地址的数量。
    size: u32,
    /// 整个网络的起始地址和地址数 (包括不可分配的网络/广播地址)，用于重叠检测。
    network: u32,
    network_len: u64,
    /// 原始 CIDR 文本 (显式构造的范围为 `None`)。
    cidr: Option<String>,
}

impl IngressRange {
    /// 解析 IPv4 CIDR，例如 `172.29.0.0/16`。
    pub fn from_cidr(cidr: &str) -> Result<Self, RangeError> {
        let (network, network_len) = parse_cidr(cidr)?;
        if network == 0 {
            return Err(RangeError::Unspecified(cidr.to_string()));
        }
        let usable = network_len.saturating_sub(2);
        Ok(IngressRange {
            first: network.wrapping_add(1),
            size: usable as u32,
            network,
            network_len,
            cidr: Some(cidr.to_string()),
        })
    }

    /// 以起始地址和数量显式构造一个范围 (所有地址都可分配)。
    pub fn new(first: Ipv4Addr, size: u32) -> Result<Self, RangeError> {
        let start = u32::from(first);
        let end = u64::from(start) + u64::from(size);
        if size == 0 || end > (1u64 << 32) {
            return Err(RangeError::InvalidSize {
                first,
                size: u64::from(size),
            });
        }
        Ok(IngressRange {
            first: start,
            size,
            network: start,
            network_len: u64::from(size),
            cidr: None,
        })
    }

    /// 可分配地址的数量。
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// 给定地址是否在可分配范围内。
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.offset_of(ip).is_some()
    }

    /// 第 `offset` 个可分配地址。
    pub fn nth(&self, offset: usize) -> Option<Ipv4Addr> {
        if offset >= self.size() {
            return None;
        }
        Some(Ipv4Addr::from(self.first + offset as u32))
    }

    /// 地址相对于第一个可分配地址的偏移。
    fn offset_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let value = u32::from(ip);
        if value < self.first {
            return None;
        }
        let offset = value - self.first;
        if offset >= self.size {
            return None;
        }
        Some(offset as usize)
    }

    /// 与另一个 CIDR 描述的网络是否重叠。
    pub fn overlaps(&self, other_cidr: &str) -> Result<bool, RangeError> {
        let (other, other_len) = parse_cidr(other_cidr)?;
        let self_end = u64::from(self.network) + self.network_len;
        let other_end = u64::from(other) + other_len;
        Ok(u64::from(self.network) < other_end && u64::from(other) < self_end)
    }
}

impl FromStr for IngressRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngressRange::from_cidr(s)
    }
}

impl fmt::Display for IngressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cidr {
            Some(cidr) => write!(f, "{}", cidr),
            None => write!(
                f,
                "{}-{}",
                Ipv4Addr::from(self.first),
                Ipv4Addr::from(self.first + (self.size - 1))
            ),
        }
    }
}

/// 解析 CIDR，返回 (网络地址, 网络中的地址总数)。
fn parse_cidr(cidr: &str) -> Result<(u32, u64), RangeError> {
    let invalid = || RangeError::InvalidCidr(cidr.to_string());
    let (ip_part, prefix_part) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    if ip_part.contains(':') {
        return Err(RangeError::Unsupported(cidr.to_string()));
    }
    let ip: Ipv4Addr = ip_part.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix_part.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ok((u32::from(ip) & mask, 1u64 << (32 - prefix)))
}

/// `AddressAllocator` Trait
///
/// 有限地址池上的分配接口。实现者不做任何 I/O，调用者负责串行化访问。
/// 实现此 Trait 的组件负责：
/// 1. 记录每个地址是否已分配。
/// 2. 按确定的顺序给出下一个空闲地址。
/// 3. 对范围外、重复分配、重复释放的地址返回对应的 `AllocatorError`。
pub trait AddressAllocator: Send + 'static {
    /// 分配指定地址。
    ///
    /// # Arguments
    /// * `ip` - 要占用的地址。
    ///
    /// # Returns
    /// - `Ok(())`: 地址已被占用。
    /// - `Err(AllocatorError::NotInRange)`: 地址不在地址池中。
    /// - `Err(AllocatorError::AlreadyAllocated)`: 地址已被占用 (分配器状态不变)。
    fn allocate(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError>;

    /// 分配下一个空闲地址 (最低地址优先)。
    ///
    /// # Returns
    /// 被占用的地址；地址池耗尽时返回 `Err(AllocatorError::Full)`。
    fn allocate_next(&mut self) -> Result<Ipv4Addr, AllocatorError>;

    /// 释放地址。
    ///
    /// # Arguments
    /// * `ip` - 之前由 `allocate` 或 `allocate_next` 占用的地址。
    ///
    /// # Returns
    /// 地址不在池中或未被占用时返回错误，这表示调用者的记录与分配器不一致。
    fn release(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError>;

    /// 地址当前是否已分配。
    fn has(&self, ip: Ipv4Addr) -> bool;

    /// 剩余可分配地址的数量。
    fn free(&self) -> usize;

    /// 已分配地址的数量。
    fn used(&self) -> usize;

    /// 地址池的文本描述 (用于日志和错误消息)。
    fn range_description(&self) -> String;
}

/// `AddressAllocator` 的默认实现，每个地址对应位图中的一位。
pub struct RangeAllocator {
    range: IngressRange,
    bits: FixedBitSet,
    count: usize,
}

impl RangeAllocator {
    /// 为给定范围创建一个空的分配器。
    pub fn new(range: IngressRange) -> Self {
        let bits = FixedBitSet::with_capacity(range.size());
        RangeAllocator {
            range,
            bits,
            count: 0,
        }
    }

    /// 分配器覆盖的地址范围。
    pub fn range(&self) -> &IngressRange {
        &self.range
    }

    fn not_in_range(&self, ip: Ipv4Addr) -> AllocatorError {
        AllocatorError::NotInRange {
            ip,
            range: self.range.to_string(),
        }
    }
}

impl AddressAllocator for RangeAllocator {
    fn allocate(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError> {
        let offset = self
            .range
            .offset_of(ip)
            .ok_or_else(|| self.not_in_range(ip))?;
        if self.bits.contains(offset) {
            return Err(AllocatorError::AlreadyAllocated(ip));
        }
        self.bits.insert(offset);
        self.count += 1;
        Ok(())
    }

    fn allocate_next(&mut self) -> Result<Ipv4Addr, AllocatorError> {
        let offset = self.bits.zeroes().next().ok_or(AllocatorError::Full)?;
        let ip = self.range.nth(offset).ok_or(AllocatorError::Full)?;
        self.bits.insert(offset);
        self.count += 1;
        Ok(ip)
    }

    fn release(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError> {
        let offset = self
            .range
            .offset_of(ip)
            .ok_or_else(|| self.not_in_range(ip))?;
        if !self.bits.contains(offset) {
            return Err(AllocatorError::NotAllocated(ip));
        }
        self.bits.set(offset, false);
        self.count -= 1;
        Ok(())
    }

    fn has(&self, ip: Ipv4Addr) -> bool {
        self.range
            .offset_of(ip)
            .map_or(false, |offset| self.bits.contains(offset))
    }

    fn free(&self) -> usize {
        self.range.size() - self.count
    }

    fn used(&self) -> usize {
        self.count
    }

    fn range_description(&self) -> String {
        self.range.to_string()
    }
}

/// 可注入错误的分配器，其余行为委托给 `RangeAllocator`。
#[cfg(test)]
pub(crate) struct FaultyAllocator {
    inner: RangeAllocator,
    /// `allocate` 与 `allocate_next` 返回的错误
    pub(crate) allocate_error: Option<AllocatorError>,
    /// `release` 返回的错误
    pub(crate) release_error: Option<AllocatorError>,
}

#[cfg(test)]
impl FaultyAllocator {
    pub(crate) fn new(cidr: &str) -> Self {
        FaultyAllocator {
            inner: RangeAllocator::new(IngressRange::from_cidr(cidr).expect("测试 CIDR 无效")),
            allocate_error: None,
            release_error: None,
        }
    }
}

#[cfg(test)]
impl AddressAllocator for FaultyAllocator {
    fn allocate(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError> {
        match &self.allocate_error {
            Some(e) => Err(e.clone()),
            None => self.inner.allocate(ip),
        }
    }

    fn allocate_next(&mut self) -> Result<Ipv4Addr, AllocatorError> {
        match &self.allocate_error {
            Some(e) => Err(e.clone()),
            None => self.inner.allocate_next(),
        }
    }

    fn release(&mut self, ip: Ipv4Addr) -> Result<(), AllocatorError> {
        match &self.release_error {
            Some(e) => Err(e.clone()),
            None => self.inner.release(ip),
        }
    }

    fn has(&self, ip: Ipv4Addr) -> bool {
        self.inner.has(ip)
    }

    fn free(&self) -> usize {
        self.inner.free()
    }

    fn used(&self) -> usize {
        self.inner.used()
    }

    fn range_description(&self) -> String {
        self.inner.range_description()
    }
}
