//! Transport tunables.

/// Default number of bytes corresponding to one round-trip time at link
/// rate. Rounded up to a whole number of packets at construction.
pub const DEFAULT_ROUND_TRIP_BYTES: u32 = 10_000;

/// Default bound on the number of distinct-sender messages granted at once
/// (the degree of overcommitment).
pub const DEFAULT_MAX_GRANTED_MESSAGES: u32 = 4;

/// Default number of timer ticks between liveness checks.
pub const DEFAULT_TIMER_INTERVAL: u64 = 1000;

/// Default number of silent timer intervals before an RPC is abandoned.
pub const DEFAULT_TIMEOUT_INTERVALS: u32 = 100;

/// Default number of silent timer intervals before probing the peer.
pub const DEFAULT_PING_INTERVALS: u32 = 3;

/// Tunable parameters of a [`Transport`](crate::Transport).
///
/// All values are deliberate trade-offs rather than protocol constants;
/// the defaults come from measurements on 10/25 GbE datacenter links and
/// should be re-derived for other fabrics.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Byte count equal to one round-trip time at link rate. Senders may
    /// transmit this many initial bytes without a grant, and the receiver
    /// keeps this many granted-but-unreceived bytes outstanding per active
    /// message.
    pub round_trip_bytes: u32,

    /// How many bytes each new GRANT extends the granted range by. Larger
    /// values reduce grant traffic at the cost of extra buffering in the
    /// network. Zero means one packet's worth of payload.
    pub grant_increment: u32,

    /// Maximum number of incoming messages granted concurrently; all
    /// active messages have distinct senders.
    pub max_granted_messages: u32,

    /// Ascending message-size cutoffs, one per unscheduled priority class,
    /// terminated by `u32::MAX`. If index `i` holds the first entry >= the
    /// message size, the unscheduled bytes of that message use the
    /// (i+1)-th highest priority class.
    pub unsched_prio_cutoffs: Vec<u32>,

    /// Ticks between liveness checks.
    pub timer_interval: u64,

    /// Silent intervals before an RPC is abandoned with a timeout.
    pub timeout_intervals: u32,

    /// Silent intervals before probing the peer (ping or retransmission
    /// request).
    pub ping_intervals: u32,

    /// Messages at most this long retain stolen driver buffers until
    /// delivery; longer messages copy fragments out so one message cannot
    /// pin an unbounded share of the hardware buffer pool. Setting this
    /// too high risks exhausting the receive pool and deadlocking.
    pub message_zero_copy_threshold: u32,

    /// Messages at most this long skip the send selector's bookkeeping and
    /// are transmitted directly; for them the bookkeeping costs more than
    /// the packet itself.
    pub small_message_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            round_trip_bytes: DEFAULT_ROUND_TRIP_BYTES,
            grant_increment: 0,
            max_granted_messages: DEFAULT_MAX_GRANTED_MESSAGES,
            unsched_prio_cutoffs: vec![469, 5521, 15267, u32::MAX],
            timer_interval: DEFAULT_TIMER_INTERVAL,
            timeout_intervals: DEFAULT_TIMEOUT_INTERVALS,
            ping_intervals: DEFAULT_PING_INTERVALS,
            message_zero_copy_threshold: 16 << 10,
            small_message_threshold: 300,
        }
    }
}

impl TransportConfig {
    /// Check internal consistency.
    ///
    /// # Panics
    ///
    /// Panics on an invalid configuration; a misconfigured transport is a
    /// deployment error, not a runtime condition.
    pub(crate) fn validate(&self) {
        assert!(self.round_trip_bytes > 0, "round_trip_bytes must be nonzero");
        assert!(
            self.max_granted_messages > 0,
            "max_granted_messages must be nonzero"
        );
        assert!(
            self.ping_intervals >= 2,
            "ping_intervals must be at least 2 so one lost packet cannot trigger a probe"
        );
        assert!(
            self.timeout_intervals > self.ping_intervals,
            "timeout_intervals must exceed ping_intervals"
        );
        assert!(
            !self.unsched_prio_cutoffs.is_empty(),
            "at least one unscheduled priority class is required"
        );
        assert!(
            self.unsched_prio_cutoffs.windows(2).all(|w| w[0] < w[1]),
            "unsched_prio_cutoffs must be strictly ascending"
        );
        assert_eq!(
            *self.unsched_prio_cutoffs.last().unwrap(),
            u32::MAX,
            "unsched_prio_cutoffs must be terminated by u32::MAX"
        );
    }
}
