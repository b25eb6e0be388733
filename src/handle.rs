//! Single-use binding state shared by [`KcpStream`](crate::KcpStream) and
//! [`KcpListener`](crate::KcpListener).

/// Engine-side identifier of a stream or listener
pub type HandleId = u64;

/// `Unbound -> Bound -> Released`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleState {
    #[default]
    Unbound,
    Bound(HandleId),
    Released,
}

impl HandleState {
    pub fn id(&self) -> Option<HandleId> {
        match self {
            HandleState::Bound(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, HandleState::Bound(_))
    }

    /// Move to `Released`, returning the id that still needs releasing.
    pub(crate) fn release(&mut self) -> Option<HandleId> {
        let id = self.id();
        if id.is_some() {
            *self = HandleState::Released;
        }
        id
    }
}
