use std::sync::Arc;

/// Clocked behaviour shared by every component of the tile buffer.
pub trait ModuleBehaviors {
    /// Advance the component's notion of time by one cycle.
    fn tick_one(&mut self);

    /// Return the component to its reset state. Configuration is kept.
    fn reset(&mut self);
}

pub trait Parameterizable {
    type ConfigType;

    fn conf(&self) -> &Self::ConfigType;

    fn init_conf(&mut self, conf: Arc<Self::ConfigType>);
}
