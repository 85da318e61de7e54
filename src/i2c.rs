//! I2C target ABI: the full addressed-slave contract — `start`, ACK-bearing
//! `write_byte`/`read_byte`, and `stop` — dispatched through
//! `Box<dyn I2cTarget>`.

/// A device addressed as an I2C slave by a bit-banging master.
pub trait I2cTarget: Send {
    /// This target's 7-bit slave address.
    fn address(&self) -> u8;

    /// Called once the address byte has been matched. `is_read` reflects
    /// the R/W bit. Returns `true` to ACK, `false` to NACK.
    fn start(&mut self, is_read: bool) -> bool;

    /// Called on a STOP condition while this target was the active one.
    fn stop(&mut self);

    /// A full byte has been shifted in during a write transaction. Returns
    /// `true` to ACK, `false` to NACK.
    fn write_byte(&mut self, value: u8) -> bool;

    /// The master is about to clock out a byte during a read transaction.
    /// `master_will_ack` reflects whether the master intends to ACK the
    /// byte about to be sent (used by targets that pre-fetch ahead).
    fn read_byte(&mut self, master_will_ack: bool) -> u8;

    fn reset(&mut self);

    fn name(&self) -> &str;
}
