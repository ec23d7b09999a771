/// `parallelize_op!` macro for repeating an operation across
/// chunks of a frame stack along its slow (frame) axis.
///
/// - `parallelize_op!(mut stack, chunk_size, out, op)`
///
///     For registration-style passes that rewrite frames in
///     place. Splits `stack` into chunks of `chunk_size` frames
///     along axis 0, zips each chunk with the matching slice of
///     the per-frame output buffer `out`, and runs
///     `op(frame_range, &mut stack_chunk, out_chunk)` on every
///     pair in parallel. Each frame is written by exactly one
///     worker.
///
///     <br>
///
/// - `parallelize_op!(stack, chunk_size, out, op)`
///
///     Read-only variant for estimation passes: the stack
///     chunks are immutable views and only `out` is written
///     (`op(frame_range, &stack_chunk, out_chunk)`).
///
/// Call sites need `rayon::prelude::*` and `ndarray::Axis` in
/// scope. `op` returns `Result<(), CorrosuiteError>`; the first
/// error aborts the remaining chunks.
macro_rules! parallelize_op {

    (   mut $stack : ident,
        $chunk_size : expr,
        $out : ident,
        $op : expr
    ) => {
        let n_frames = $stack.shape()[0];
        let chunk_size = $chunk_size.max(1);

        // Zip mutable frame chunks with the matching output slices
        let zipped : Vec<_> = $stack
            .axis_chunks_iter_mut(Axis(0), chunk_size)
            .zip($out.chunks_mut(chunk_size))
            .collect();

        zipped.into_par_iter().enumerate().try_for_each(
            |(chunk_idx, (mut chunk, out_chunk))| -> Result<(), $crate::CorrosuiteError> {
                // Global frame indices covered by this chunk
                let start = chunk_idx * chunk_size;
                let end = ((chunk_idx + 1) * chunk_size).min(n_frames);

                $op(start..end, &mut chunk, out_chunk)
            }
        )?;
    };

    (   $stack : ident,
        $chunk_size : expr,
        $out : ident,
        $op : expr
    ) => {
        let n_frames = $stack.shape()[0];
        let chunk_size = $chunk_size.max(1);

        let zipped : Vec<_> = $stack
            .axis_chunks_iter(Axis(0), chunk_size)
            .zip($out.chunks_mut(chunk_size))
            .collect();

        zipped.into_par_iter().enumerate().try_for_each(
            |(chunk_idx, (chunk, out_chunk))| -> Result<(), $crate::CorrosuiteError> {
                let start = chunk_idx * chunk_size;
                let end = ((chunk_idx + 1) * chunk_size).min(n_frames);

                $op(start..end, &chunk, out_chunk)
            }
        )?;
    };
}

pub (crate) use parallelize_op;
