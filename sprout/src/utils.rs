/// Frame, resolution and artifact types plus the pixel domain
/// processing used to derive near infrared and vegetation index
/// images.
pub mod image;
/// Simulated collaborators for development without a kit attached.
pub mod mock;
