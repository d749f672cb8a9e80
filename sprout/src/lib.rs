/**
The sprout control system drives the camera of a plant growing kit together with
the kit's LED panel. Functionality is split the same way as the other control
systems on the machine: devices wrap a single piece of hardware, components group
devices into a unit that does useful work, and messages define what can be sent
into the running component.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall control system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Crate wide error type.
pub mod error;
/// Tracing subscriber set up for the binaries.
pub mod logging;
/// Message structure for communication into and out of the
/// control system, such as manual capture commands.
pub mod messages;
/// Image processing and development utilities.
pub mod utils;

pub use error::{Error, Result};

/// Macro that helps to check test file exist at compile time.
/// [link](https://stackoverflow.com/questions/30003921/how-can-i-locate-resources-for-testing-with-cargo)
/// [link](https://stackoverflow.com/questions/73187970/compile-time-check-if-file-at-path-exists-like-include-str)
#[macro_export]
macro_rules! test_file_path {
    ($arg1:expr) => {{
        let _ = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), $arg1));
        let r = concat!(env!("CARGO_MANIFEST_DIR"), $arg1);
        r
    }};
}
