pub const PTR_SIZE: usize = core::mem::size_of::<usize>();
const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// 页内偏移的掩码
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 交换设备的扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一页对应的扇区数，也即一个交换槽的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户地址空间的起点，0 页永远不映射
pub const USER_START: usize = 0x1000;
/// 用户地址空间的末端（不含），再往上是内核
pub const USER_END: usize = 0x80_0400_0000;

/// 用户栈顶，栈从此处向下增长
pub const USER_STACK: usize = 0x4748_0000;
/// 用户栈的大小上限
pub const STACK_LIMIT: usize = MB;
/// 栈增长判定时，允许访问地址低于 sp 的距离。对应 push 先写后减的情况
pub const STACK_SLACK: usize = PTR_SIZE;

/// 默认的用户页框数量
pub const USER_FRAMES: usize = 256;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(USER_STACK <= USER_END && USER_STACK - STACK_LIMIT >= USER_START);
