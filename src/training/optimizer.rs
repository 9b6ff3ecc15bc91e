//! The slice of an optimizer the gradient engines need: its parameter groups.

use crate::distributed::param::Parameter;

/// One optimizer parameter group.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Parameter>,
}

impl ParamGroup {
    pub fn new(params: Vec<Parameter>) -> Self {
        Self { params }
    }
}

/// Typed access to an optimizer's parameter groups.
pub trait ParameterGroups {
    fn parameter_groups(&self) -> &[ParamGroup];

    fn parameter_groups_mut(&mut self) -> &mut [ParamGroup];

    /// All parameters, group by group, in a rank-consistent order.
    fn parameters(&self) -> Box<dyn Iterator<Item = &Parameter> + '_> {
        Box::new(self.parameter_groups().iter().flat_map(|g| g.params.iter()))
    }
}

impl ParameterGroups for Vec<ParamGroup> {
    fn parameter_groups(&self) -> &[ParamGroup] {
        self
    }

    fn parameter_groups_mut(&mut self) -> &mut [ParamGroup] {
        self
    }
}

impl ParameterGroups for [ParamGroup] {
    fn parameter_groups(&self) -> &[ParamGroup] {
        self
    }

    fn parameter_groups_mut(&mut self) -> &mut [ParamGroup] {
        self
    }
}
