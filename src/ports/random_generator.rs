use super::TokenResult;

pub trait RandomGenerator {
    /// `C_GenerateRandom`
    fn generate_random(&mut self, len: usize) -> TokenResult<Vec<u8>>;
}
