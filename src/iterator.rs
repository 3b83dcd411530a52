use crate::IResult;

/// A stateful positional reader over an ordered entry sequence. Positioning
/// past both ends leaves the cursor invalid; `key`/`value` may only be
/// called while `valid()` holds.
pub trait Cursor {
    fn valid(&self) -> bool;

    /// Positions at the first entry.
    fn seek_to_first(&mut self);

    /// Positions at the last entry.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with key >= `target`, or past the end
    /// if there is none.
    fn seek(&mut self, target: &[u8]);

    /// Advances one entry. Must not be called on an invalid cursor.
    fn next(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Takes the first error this cursor ran into, if any. A cursor that
    /// observed corruption stays invalid.
    fn status(&mut self) -> IResult<()>;

    fn eof(&self) -> bool {
        !self.valid()
    }
}
