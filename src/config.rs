use embassy_time::Duration;

/// Upper bound for the total amount of TX buffer space, across all descriptors.
pub const TX_DATA_MAX: usize = 8192;
/// Upper bound for the total amount of RX buffer space, across all descriptors.
pub const RX_DATA_MAX: usize = 4096;
pub const CMD_BUF_MAX: usize = 4096;
pub const CIS_BUF_MAX: usize = 4096;

/// How long a single chunk of a TX transfer may wait for a free descriptor.
pub const TX_DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(100);

/// Depth of the queue between the interrupt handler and the dispatcher.
pub const EVENT_QUEUE_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Sizes of the buffers shared with the DMA engine.
pub struct BufferLayout {
    /// Number of TX buffer descriptors.
    pub tx_link_num: u16,
    /// Maximum length of the frame behind one TX buffer descriptor.
    pub tx_buf_len: u16,
    /// Number of RX buffer descriptors.
    pub rx_link_num: u16,
    /// Size of the receive buffer behind each RX buffer descriptor.
    pub rx_buf_len: u16,
    /// Size of the command buffer. Must be a multiple of four.
    pub cmd_buf_len: u16,
    /// Size of each of the two CIS buffers. Only used by SDIO.
    pub cis_len: u16,
}
impl BufferLayout {
    /// The largest transfer, that fits into the TX ring at once.
    pub const fn tx_capacity(&self) -> usize {
        self.tx_link_num as usize * self.tx_buf_len as usize
    }
    pub const fn rx_capacity(&self) -> usize {
        self.rx_link_num as usize * self.rx_buf_len as usize
    }
}
impl Default for BufferLayout {
    fn default() -> Self {
        Self {
            tx_link_num: 8,
            tx_buf_len: 1024,
            rx_link_num: 4,
            rx_buf_len: 1024,
            cmd_buf_len: 256,
            cis_len: 128,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The part of the address space, that the DMA engine can reach.
pub struct DramWindow {
    pub base: u32,
    pub len: u32,
}
impl DramWindow {
    pub const W80X: Self = Self {
        base: 0x2000_0000,
        len: 0x4_8000,
    };
    /// Check that `[addr, addr + len)` lies completely inside the window.
    pub const fn contains(&self, addr: u32, len: usize) -> bool {
        let end = addr as u64 + len as u64;
        addr >= self.base && end <= self.base as u64 + self.len as u64
    }
}
impl Default for DramWindow {
    fn default() -> Self {
        Self::W80X
    }
}
