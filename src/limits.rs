// Hard caps on client-supplied input. Checked before any lock is taken.

pub const MAX_EQUIPMENT_TYPES: usize = 10_000;
pub const MAX_ASSETS_PER_EQUIPMENT: usize = 10_000;
pub const MAX_LINE_ITEMS: usize = 64;
pub const MAX_QUANTITY_PER_ITEM: u32 = 1_000;
pub const MAX_RETURN_ITEMS: usize = 1_024;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
/// Longest reservation range in days.
pub const MAX_RESERVATION_DAYS: i64 = 366;
/// Longest accepted request line on the wire.
pub const MAX_REQUEST_LINE_BYTES: usize = 1024 * 1024;
