/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Device interface for the kit camera.
    pub mod camera;
    /// Device interface for the LED panel.
    pub mod led_panel;
}

/// Collaborators that are not backed by a physical device.
pub mod software {
    /// Where finished images are handed off to.
    pub mod publisher;
    /// Daily capture schedule.
    pub mod schedule;
}
