/// Standardise how messages are sent into and out of
/// the current control system. Provide test suite to
/// ensure interfaces are respected.
pub mod control {
    /// Capture commands and the responses sent back for
    /// every control message.
    pub mod capture;
    /// Light messages set the LED panel by hand.
    pub mod light;
}
