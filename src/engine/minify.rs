use crate::engine::Transform;

/// Collapses every run of ASCII whitespace to a single byte (a newline if the
/// run contained one, a space otherwise) and trims both ends.
///
/// The output is never longer than the input, so it always fits a result
/// buffer sized like the source.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceMinifier;

impl WhitespaceMinifier {
    fn run<F: FnMut(u8)>(input: &[u8], mut emit: F) {
        let mut pending: Option<u8> = None;
        let mut started = false;

        for &b in input {
            if b.is_ascii_whitespace() {
                if started {
                    pending = Some(match pending {
                        Some(b'\n') => b'\n',
                        _ if b == b'\n' => b'\n',
                        _ => b' ',
                    });
                }
                continue;
            }
            if let Some(sep) = pending.take() {
                emit(sep);
            }
            emit(b);
            started = true;
        }
    }
}

impl Transform for WhitespaceMinifier {
    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, String> {
        let mut out = Vec::with_capacity(input.len());
        Self::run(input, |b| out.push(b));
        Ok(out)
    }

    fn transform_into(&self, input: &[u8], out: &mut [u8]) -> Result<usize, String> {
        if out.len() < input.len() {
            return Err(format!(
                "result buffer of {} bytes is smaller than the {} byte source",
                out.len(),
                input.len()
            ));
        }
        let mut n = 0;
        Self::run(input, |b| {
            out[n] = b;
            n += 1;
        });
        Ok(n)
    }
}
