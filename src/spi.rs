//! SPI target ABI: a `Send` trait object for "one bit-banged SPI target
//! selected by a chip-select line", dispatched through `Box<dyn SpiTarget>`.

/// A device driven as an SPI slave by a bit-banging master.
pub trait SpiTarget: Send {
    /// Called when this target's chip-select line goes active (low).
    fn select(&mut self);

    /// Called when this target's chip-select line goes inactive (high), or
    /// when a different target is selected in its place.
    fn deselect(&mut self);

    /// One SCK rising edge: the master presents `mosi_bit` (0 or 1) and the
    /// target returns the bit it drives onto MISO.
    fn transfer(&mut self, mosi_bit: u8) -> u8;

    /// One SCK falling edge: an idempotent "advance" hook, used by targets
    /// that must not begin emitting a new response mid-command.
    fn on_sck_falling(&mut self);

    fn reset(&mut self);

    fn is_selected(&self) -> bool;

    fn name(&self) -> &str;
}
