use mitopack::BindError;
use mitopack::TypeId;

#[derive(Debug)]
pub enum Error {
    /// The type graph references itself; the shareability predicate would
    /// not be decidable. Raised at registration time.
    CircularTypeReference(TypeId),
    /// The value graph references itself. Raised at runtime.
    CircularReference,
    /// A descriptor names a type that has not been defined.
    UndefinedType(TypeId),
    Bind(BindError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircularTypeReference(ty) => {
                write!(f, "type graph contains a circular reference through {}", ty)
            }
            Self::CircularReference => write!(f, "value graph contains a circular reference"),
            Self::UndefinedType(ty) => write!(f, "type {} is not defined", ty),
            Self::Bind(e) => write!(f, "struct binding failed: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<BindError> for Error {
    fn from(e: BindError) -> Self {
        Self::Bind(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
