//! Size-class table.
//!
//! Sizes are grouped into orders (the position of the most significant bit)
//! and every order is split into eight equal buckets, so bucket sizes grow
//! geometrically and a request is rounded up by at most one eighth of its
//! order. Orders 5 through 20 are bucketed:
//!
//! ```text
//! order  5: 16  18  20  22  24  26  28  30      (only 16 is real)
//! order  6: 32  36  40  44  48  52  56  60      (32, 48)
//! order  7: 64  72  80  88  96 104 112 120      (64, 80, 96, 112)
//! order  8: 128 144 160 ... 240                 (all real from here on)
//! ...
//! order 20: 524288 589824 ... 983040
//! ```
//!
//! Bucket sizes that are not a multiple of the minimum alignment are
//! pseudo-buckets; lookups skip forward to the next real bucket. Requests
//! above the largest bucket map to [`SENTINEL_BUCKET`] and are direct-mapped.
//! The whole table is computed at compile time.

/// Minimum alignment of every returned slot, and the smallest bucket size.
pub const ALIGNMENT: usize = 16;
pub const SMALLEST_BUCKET: usize = ALIGNMENT;

pub const NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const NUM_BUCKETS_PER_ORDER: usize = 1 << NUM_BUCKETS_PER_ORDER_BITS;
pub const MIN_BUCKETED_ORDER: usize = 5;
pub const MAX_BUCKETED_ORDER: usize = 20;
pub const NUM_BUCKETED_ORDERS: usize = MAX_BUCKETED_ORDER - MIN_BUCKETED_ORDER + 1;
pub const NUM_BUCKETS: usize = NUM_BUCKETED_ORDERS * NUM_BUCKETS_PER_ORDER;

const MAX_BUCKET_SPACING: usize = 1 << ((MAX_BUCKETED_ORDER - 1) - NUM_BUCKETS_PER_ORDER_BITS);

/// Largest bucketed slot size; anything larger is direct-mapped.
pub const MAX_BUCKETED: usize =
    (1 << (MAX_BUCKETED_ORDER - 1)) + (NUM_BUCKETS_PER_ORDER - 1) * MAX_BUCKET_SPACING;

/// Index of the bucket that owns direct-mapped spans.
pub const SENTINEL_BUCKET: usize = NUM_BUCKETS;

const BITS: usize = usize::BITS as usize;
const NUM_LOOKUPS: usize = (BITS + 1) * NUM_BUCKETS_PER_ORDER + 1;

const _: () = assert!(MAX_BUCKETED == 983_040);
const _: () = assert!(NUM_BUCKETS == 128);
const _: () = assert!(SENTINEL_BUCKET <= u8::MAX as usize);

/// Precomputed order shifts, sub-order masks, bucket sizes and the
/// size-to-bucket lookup.
pub struct SizeClassTable {
    slot_sizes: [usize; NUM_BUCKETS],
    order_index_shifts: [u8; BITS + 1],
    order_sub_index_masks: [usize; BITS + 1],
    lookups: [u8; NUM_LOOKUPS],
}

impl SizeClassTable {
    const fn build() -> Self {
        let mut order_index_shifts = [0u8; BITS + 1];
        let mut order_sub_index_masks = [0usize; BITS + 1];
        let mut order = 0;
        while order <= BITS {
            order_index_shifts[order] = if order < NUM_BUCKETS_PER_ORDER_BITS + 1 {
                0
            } else {
                (order - (NUM_BUCKETS_PER_ORDER_BITS + 1)) as u8
            };
            order_sub_index_masks[order] = if order == BITS {
                usize::MAX >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
            } else {
                ((1usize << order) - 1) >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
            };
            order += 1;
        }

        let mut slot_sizes = [0usize; NUM_BUCKETS];
        let mut current_size = SMALLEST_BUCKET;
        let mut current_increment = SMALLEST_BUCKET >> NUM_BUCKETS_PER_ORDER_BITS;
        let mut index = 0;
        let mut i = 0;
        while i < NUM_BUCKETED_ORDERS {
            let mut j = 0;
            while j < NUM_BUCKETS_PER_ORDER {
                slot_sizes[index] = current_size;
                current_size += current_increment;
                index += 1;
                j += 1;
            }
            current_increment <<= 1;
            i += 1;
        }

        let mut lookups = [SENTINEL_BUCKET as u8; NUM_LOOKUPS];
        let mut bucket = 0;
        let mut entry = 0;
        let mut order = 0;
        while order <= BITS {
            let mut j = 0;
            while j < NUM_BUCKETS_PER_ORDER {
                lookups[entry] = if order < MIN_BUCKETED_ORDER {
                    // Finest granularity for tiny requests, including zero.
                    0
                } else if order > MAX_BUCKETED_ORDER {
                    SENTINEL_BUCKET as u8
                } else {
                    let mut valid = bucket;
                    while slot_sizes[valid] % SMALLEST_BUCKET != 0 {
                        valid += 1;
                    }
                    bucket += 1;
                    valid as u8
                };
                entry += 1;
                j += 1;
            }
            order += 1;
        }
        // Overflow entry for sizes whose sub-order bits bump past the last order.
        lookups[entry] = SENTINEL_BUCKET as u8;

        Self {
            slot_sizes,
            order_index_shifts,
            order_sub_index_masks,
            lookups,
        }
    }

    /// Bucket index serving `size`; [`SENTINEL_BUCKET`] above [`MAX_BUCKETED`].
    #[inline]
    #[must_use]
    pub const fn bucket_index_for(&self, size: usize) -> usize {
        let order = BITS - size.leading_zeros() as usize;
        let order_index =
            (size >> self.order_index_shifts[order]) & (NUM_BUCKETS_PER_ORDER - 1);
        let sub_order_index = size & self.order_sub_index_masks[order];
        let bump = if sub_order_index != 0 { 1 } else { 0 };
        self.lookups[(order << NUM_BUCKETS_PER_ORDER_BITS) + order_index + bump] as usize
    }

    /// Slot size of a bucket; zero for the sentinel.
    #[inline]
    #[must_use]
    pub const fn slot_size(&self, index: usize) -> usize {
        if index < NUM_BUCKETS {
            self.slot_sizes[index]
        } else {
            0
        }
    }

    /// Whether a bucket is real rather than a pseudo-bucket.
    #[inline]
    #[must_use]
    pub const fn is_valid_bucket(&self, index: usize) -> bool {
        index < NUM_BUCKETS && self.slot_sizes[index] % SMALLEST_BUCKET == 0
    }
}

static TABLE: SizeClassTable = SizeClassTable::build();

/// The process-wide size-class table.
#[must_use]
pub fn table() -> &'static SizeClassTable {
    &TABLE
}

/// Bucket index serving `size`.
#[inline]
#[must_use]
pub fn bucket_index_for(size: usize) -> usize {
    TABLE.bucket_index_for(size)
}

/// Slot size of bucket `index` (zero for the sentinel).
#[inline]
#[must_use]
pub fn bucket_slot_size(index: usize) -> usize {
    TABLE.slot_size(index)
}

#[inline]
#[must_use]
pub fn is_valid_bucket(index: usize) -> bool {
    TABLE.is_valid_bucket(index)
}
