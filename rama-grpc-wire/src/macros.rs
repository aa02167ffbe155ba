/// Generate a `with_*` (consuming) and `set_*` (by mutable reference)
/// builder method pair from a single definition.
///
/// The body must only assign fields on `self` and end in `self`,
/// it is expanded once for each receiver form.
macro_rules! generate_set_and_with {
    (
        $(#[$doc:meta])*
        $vis:vis fn $fn_name:ident(mut $self:ident $(, $param:ident: $ty:ty)* $(,)?) -> Self $body:block
    ) => {
        ::paste::paste! {
            $(#[$doc])*
            #[must_use]
            $vis fn [<with_ $fn_name>](mut $self $(, $param: $ty)*) -> Self $body

            $(#[$doc])*
            $vis fn [<set_ $fn_name>](&mut $self $(, $param: $ty)*) -> &mut Self $body
        }
    };
}

pub(crate) use generate_set_and_with;
