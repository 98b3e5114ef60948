/**
 * How long (seconds) a scan runs before the bluetooth stack reports that it stopped.
 */
pub const SCAN_SECONDS: u64 = 3;

/**
 * Report every advertisement, not only the first one per peripheral, so that the name and the
 * signal strength keep updating during the scan window.
 */
pub const ALLOW_DUPLICATES: bool = true;

/**
 * How long (milliseconds) to wait after the link is established before enumerating services.
 * Service enumeration right after connecting is unreliable on several bluetooth stacks.
 */
pub const SETTLE_DELAY: u64 = 900;

/**
 * Display name for peripherals that do not advertise a name.
 */
pub const NO_NAME: &str = "NO NAME";
