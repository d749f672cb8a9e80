/// Components that make up the plant growing kit.
pub mod kit {
    /// Components that provide sensing capability.
    pub mod sensing {
        /// The kit camera component and its controller.
        pub mod camera;
        /// Sequences lighting, settle delays and frame captures.
        pub mod orchestrator;
        /// Serialises explicit and scheduled capture requests.
        pub mod trigger;
    }
    /// Components that provide actuation capability.
    pub mod actuating {
        /// Exclusive control over the LED panel.
        pub mod lighting;
    }
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::kit::actuating::lighting::*;
    pub use crate::components::kit::sensing::camera::*;
    pub use crate::components::kit::sensing::orchestrator::*;
    pub use crate::components::kit::sensing::trigger::*;
}
